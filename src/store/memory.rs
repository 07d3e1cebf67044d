//! In-process stores.
//!
//! `MemoryTaskStore` serializes transactions: `begin` takes the store lock and holds it
//! until the transaction is committed or dropped. Writes go to a working copy, so a
//! transaction that is never committed leaves the shared state untouched.
//!
//! Stores built by [`linked_stores`] share their state and enforce the same user references
//! as the Postgres schema. A `MemoryTaskStore` built on its own accepts any user id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{unknown_user, user_in_use, user_not_found, TaskStore, TaskTransaction, UserStore};
use crate::error::AppError;
use crate::models::{Assignment, FieldUpdate, NewTask, Role, Task, UserRecord};

#[derive(Debug, Clone, Default)]
struct TaskState {
    next_id: i32,
    tasks: BTreeMap<i32, Task>,
    assignments: BTreeMap<(i32, i32), Assignment>,
}

impl TaskState {
    fn assignments_of(&self, task_id: i32) -> Vec<Assignment> {
        self.assignments
            .range((task_id, i32::MIN)..=(task_id, i32::MAX))
            .map(|(_, assignment)| assignment.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
struct UserTable {
    last_id: i32,
    users: Vec<UserRecord>,
}

impl UserTable {
    fn contains(&self, user_id: i32) -> bool {
        self.users.iter().any(|user| user.id == user_id)
    }
}

type SharedUsers = Arc<RwLock<UserTable>>;

/// Returns a user store and a task store over the same state.
pub fn linked_stores() -> (MemoryUserStore, MemoryTaskStore) {
    let users = SharedUsers::default();
    let tasks = Arc::new(Mutex::new(TaskState::default()));
    (
        MemoryUserStore {
            users: users.clone(),
            tasks: tasks.clone(),
        },
        MemoryTaskStore {
            state: tasks,
            users: Some(users),
        },
    )
}

#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: SharedUsers,
    tasks: Arc<Mutex<TaskState>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AppError> {
        Ok(self
            .users
            .read()
            .users
            .iter()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<UserRecord, AppError> {
        let mut table = self.users.write();
        if table.users.iter().any(|user| user.username == username) {
            return Err(AppError::BadRequest("Username already taken".into()));
        }
        table.last_id += 1;
        let record = UserRecord {
            id: table.last_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            role,
            created_at: Utc::now(),
        };
        table.users.push(record.clone());
        Ok(record)
    }

    async fn list_users(&self, username: Option<&str>) -> Result<Vec<UserRecord>, AppError> {
        Ok(self
            .users
            .read()
            .users
            .iter()
            .filter(|user| username.map_or(true, |part| user.username.contains(part)))
            .cloned()
            .collect())
    }

    async fn delete_user(&self, user_id: i32) -> Result<(), AppError> {
        // Lock order: task state, then users.
        let mut tasks = self.tasks.lock().await;
        if !self.users.read().contains(user_id) {
            return Err(user_not_found(user_id));
        }
        let referenced = tasks.tasks.values().any(|task| task.created_by == user_id)
            || tasks
                .assignments
                .values()
                .any(|edge| edge.sent_by == user_id && edge.user_id != user_id);
        if referenced {
            return Err(user_in_use(user_id));
        }

        tasks.assignments.retain(|_, edge| edge.user_id != user_id);
        self.users.write().users.retain(|user| user.id != user_id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    state: Arc<Mutex<TaskState>>,
    users: Option<SharedUsers>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn begin(&self) -> Result<Box<dyn TaskTransaction>, AppError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTaskTransaction {
            guard,
            working,
            users: self.users.clone(),
        }))
    }

    async fn find_task(&self, task_id: i32) -> Result<Option<Task>, AppError> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn assignments(&self, task_id: i32) -> Result<Vec<Assignment>, AppError> {
        Ok(self.state.lock().await.assignments_of(task_id))
    }

    async fn tasks_for_user(&self, user_id: i32) -> Result<Vec<Task>, AppError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .assignments
            .values()
            .filter(|assignment| assignment.user_id == user_id)
            .filter_map(|assignment| state.tasks.get(&assignment.task_id).cloned())
            .collect();
        tasks.sort_by_key(|task| (task.due_date.is_none(), task.due_date, task.id));
        Ok(tasks)
    }
}

pub struct MemoryTaskTransaction {
    guard: OwnedMutexGuard<TaskState>,
    working: TaskState,
    users: Option<SharedUsers>,
}

impl MemoryTaskTransaction {
    fn check_user(&self, user_id: i32) -> Result<(), AppError> {
        match &self.users {
            Some(users) if !users.read().contains(user_id) => Err(unknown_user(user_id)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TaskTransaction for MemoryTaskTransaction {
    async fn lock_task(&mut self, task_id: i32) -> Result<bool, AppError> {
        Ok(self.working.tasks.contains_key(&task_id))
    }

    async fn insert_task(&mut self, task: &NewTask, created_by: i32) -> Result<i32, AppError> {
        self.check_user(created_by)?;
        self.working.next_id += 1;
        let id = self.working.next_id;
        self.working.tasks.insert(
            id,
            Task {
                id,
                title: task.title.clone(),
                description: task.description.clone(),
                due_date: task.due_date,
                priority: task.priority.clone(),
                file_path: task.file_path.clone(),
                created_by,
            },
        );
        Ok(id)
    }

    async fn update_task(&mut self, task_id: i32, updates: &[FieldUpdate]) -> Result<(), AppError> {
        if updates.is_empty() {
            return Ok(());
        }
        let task = self
            .working
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| AppError::task_not_found(task_id))?;
        for update in updates {
            update.apply(task);
        }
        Ok(())
    }

    async fn assignments(&mut self, task_id: i32) -> Result<Vec<Assignment>, AppError> {
        Ok(self.working.assignments_of(task_id))
    }

    async fn insert_assignment(
        &mut self,
        task_id: i32,
        user_id: i32,
        sent_by: i32,
        assigned_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if !self.working.tasks.contains_key(&task_id) {
            return Err(AppError::DatabaseError(format!(
                "Failed to assign task to user {}: task {} does not exist",
                user_id, task_id
            )));
        }
        if self.working.assignments.contains_key(&(task_id, user_id)) {
            return Err(AppError::DatabaseError(format!(
                "Failed to assign task to user {}: duplicate assignment",
                user_id
            )));
        }
        self.check_user(user_id)?;
        self.check_user(sent_by)?;
        self.working.assignments.insert(
            (task_id, user_id),
            Assignment {
                task_id,
                user_id,
                sent_by,
                assigned_at,
            },
        );
        Ok(())
    }

    async fn delete_assignment(&mut self, task_id: i32, user_id: i32) -> Result<(), AppError> {
        self.working.assignments.remove(&(task_id, user_id));
        Ok(())
    }

    async fn delete_assignments(&mut self, task_id: i32) -> Result<u64, AppError> {
        let before = self.working.assignments.len();
        self.working
            .assignments
            .retain(|(edge_task, _), _| *edge_task != task_id);
        Ok((before - self.working.assignments.len()) as u64)
    }

    async fn delete_task(&mut self, task_id: i32) -> Result<u64, AppError> {
        Ok(self.working.tasks.remove(&task_id).map_or(0, |_| 1))
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryTaskTransaction { mut guard, working, .. } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }
}
