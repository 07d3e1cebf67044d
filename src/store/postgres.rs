use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use super::{unknown_user, user_in_use, user_not_found, TaskStore, TaskTransaction, UserStore};
use crate::error::AppError;
use crate::models::{Assignment, FieldUpdate, NewTask, Role, Task, UserRecord};

const TASK_COLUMNS: &str = "id, title, description, due_date, priority, file_path, created_by";
const ASSIGNMENT_COLUMNS: &str = "task_id, user_id, sent_by, assigned_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i32,
    username: String,
    password_hash: String,
    role: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = AppError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = row
            .role
            .parse::<Role>()
            .map_err(|e| AppError::InternalServerError(format!("User {}: {}", row.id, e)))?;
        Ok(UserRecord {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            role,
            created_at: row.created_at,
        })
    }
}

/// Name of the violated constraint when `e` is a foreign key violation.
fn violated_reference(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
            Some(db_err.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

/// Credential store backed by the `users` table.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, role, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::db("look up user", e))?;

        row.map(UserRecord::try_from).transpose()
    }

    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<UserRecord, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (username, password_hash, role) VALUES ($1, $2, $3)
             RETURNING id, username, password_hash, role, created_at",
        )
        .bind(username)
        .bind(password_hash)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::BadRequest("Username already taken".into())
            }
            other => AppError::db("insert user", other),
        })?;

        UserRecord::try_from(row)
    }

    async fn list_users(&self, username: Option<&str>) -> Result<Vec<UserRecord>, AppError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, role, created_at FROM users
             WHERE $1::TEXT IS NULL OR strpos(username, $1) > 0
             ORDER BY id",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::db("list users", e))?;

        rows.into_iter().map(UserRecord::try_from).collect()
    }

    async fn delete_user(&self, user_id: i32) -> Result<(), AppError> {
        // Received assignments cascade; created tasks and sent assignments block the delete.
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match violated_reference(&e) {
                Some(_) => user_in_use(user_id),
                None => AppError::db("delete user", e),
            })?;

        if result.rows_affected() == 0 {
            return Err(user_not_found(user_id));
        }
        Ok(())
    }
}

/// Task store backed by the `tasks` and `tasks_users` tables.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn begin(&self) -> Result<Box<dyn TaskTransaction>, AppError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::db("begin transaction", e))?;
        Ok(Box::new(PgTaskTransaction { tx }))
    }

    async fn find_task(&self, task_id: i32) -> Result<Option<Task>, AppError> {
        sqlx::query_as::<_, Task>(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::db("retrieve task", e))
    }

    async fn assignments(&self, task_id: i32) -> Result<Vec<Assignment>, AppError> {
        sqlx::query_as::<_, Assignment>(&format!(
            "SELECT {} FROM tasks_users WHERE task_id = $1 ORDER BY user_id",
            ASSIGNMENT_COLUMNS
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::db("retrieve users for task", e))
    }

    async fn tasks_for_user(&self, user_id: i32) -> Result<Vec<Task>, AppError> {
        sqlx::query_as::<_, Task>(
            "SELECT t.id, t.title, t.description, t.due_date, t.priority, t.file_path, t.created_by
             FROM tasks t
             JOIN tasks_users tu ON t.id = tu.task_id
             WHERE tu.user_id = $1
             ORDER BY t.due_date ASC NULLS LAST, t.id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::db("retrieve tasks for user", e))
    }
}

pub struct PgTaskTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TaskTransaction for PgTaskTransaction {
    async fn lock_task(&mut self, task_id: i32) -> Result<bool, AppError> {
        let row = sqlx::query_as::<_, (i32,)>("SELECT id FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| AppError::db("lock task", e))?;
        Ok(row.is_some())
    }

    async fn insert_task(&mut self, task: &NewTask, created_by: i32) -> Result<i32, AppError> {
        let (id,) = sqlx::query_as::<_, (i32,)>(
            "INSERT INTO tasks (title, description, due_date, priority, file_path, created_by)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.due_date)
        .bind(&task.priority)
        .bind(&task.file_path)
        .bind(created_by)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match violated_reference(&e) {
            Some(_) => unknown_user(created_by),
            None => AppError::db("create task", e),
        })?;
        Ok(id)
    }

    async fn update_task(&mut self, task_id: i32, updates: &[FieldUpdate]) -> Result<(), AppError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE tasks SET ");
        let mut assignments = builder.separated(", ");
        for update in updates {
            assignments.push(format!("{} = ", update.column()));
            match update {
                FieldUpdate::Title(v) | FieldUpdate::Description(v) | FieldUpdate::Priority(v) => {
                    assignments.push_bind_unseparated(v.clone());
                }
                FieldUpdate::DueDate(v) => {
                    assignments.push_bind_unseparated(*v);
                }
                FieldUpdate::FilePath(v) => {
                    assignments.push_bind_unseparated(v.clone());
                }
            }
        }
        builder.push(" WHERE id = ");
        builder.push_bind(task_id);

        let result = builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::db("update task", e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::task_not_found(task_id));
        }
        Ok(())
    }

    async fn assignments(&mut self, task_id: i32) -> Result<Vec<Assignment>, AppError> {
        sqlx::query_as::<_, Assignment>(&format!(
            "SELECT {} FROM tasks_users WHERE task_id = $1",
            ASSIGNMENT_COLUMNS
        ))
        .bind(task_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::db("retrieve current users for task", e))
    }

    async fn insert_assignment(
        &mut self,
        task_id: i32,
        user_id: i32,
        sent_by: i32,
        assigned_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO tasks_users (task_id, user_id, sent_by, assigned_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(task_id)
        .bind(user_id)
        .bind(sent_by)
        .bind(assigned_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match violated_reference(&e) {
            Some(constraint) if constraint.contains("sent_by") => unknown_user(sent_by),
            Some(_) => unknown_user(user_id),
            None => AppError::db(&format!("assign task to user {}", user_id), e),
        })?;
        Ok(())
    }

    async fn delete_assignment(&mut self, task_id: i32, user_id: i32) -> Result<(), AppError> {
        sqlx::query("DELETE FROM tasks_users WHERE task_id = $1 AND user_id = $2")
            .bind(task_id)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::db(&format!("unassign task from user {}", user_id), e))?;
        Ok(())
    }

    async fn delete_assignments(&mut self, task_id: i32) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM tasks_users WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::db("delete task-user associations", e))?;
        Ok(result.rows_affected())
    }

    async fn delete_task(&mut self, task_id: i32) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::db("delete task", e))?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx
            .commit()
            .await
            .map_err(|e| AppError::db("commit transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| AppError::db("roll back transaction", e))
    }
}
