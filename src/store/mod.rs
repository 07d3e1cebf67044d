//! Persistence seams.
//!
//! The reconciliation engine and the auth service talk to storage only through the traits
//! in this module. [`postgres`] is the production backend; [`memory`] keeps everything
//! in-process and is used when no `DATABASE_URL` is configured and by the test suite.
//!
//! Transactions are explicit: [`TaskStore::begin`] hands out a [`TaskTransaction`] and the
//! caller decides whether to [`commit`](TaskTransaction::commit) or
//! [`rollback`](TaskTransaction::rollback). Dropping a transaction without committing
//! discards its writes.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{Assignment, FieldUpdate, NewTask, Role, Task, UserRecord};

pub use memory::{linked_stores, MemoryTaskStore, MemoryUserStore};
pub use postgres::{PgTaskStore, PgUserStore};

/// Read access to credentials, plus the account administration used outside the core.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AppError>;

    /// Inserts a new account. A taken username is reported as `BadRequest`.
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<UserRecord, AppError>;

    /// All accounts in id order. `username` keeps only names containing that substring.
    async fn list_users(&self, username: Option<&str>) -> Result<Vec<UserRecord>, AppError>;

    /// Removes an account and the assignments it holds. Accounts that created tasks or
    /// sent assignments are kept and reported as `BadRequest`.
    async fn delete_user(&self, user_id: i32) -> Result<(), AppError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn TaskTransaction>, AppError>;

    async fn find_task(&self, task_id: i32) -> Result<Option<Task>, AppError>;

    async fn assignments(&self, task_id: i32) -> Result<Vec<Assignment>, AppError>;

    /// Tasks the user is assigned to, ordered by due date with undated tasks last.
    async fn tasks_for_user(&self, user_id: i32) -> Result<Vec<Task>, AppError>;
}

/// Writes against `tasks` and `tasks_users` inside one transaction.
#[async_trait]
pub trait TaskTransaction: Send {
    /// Locks the task row for the rest of the transaction. Returns `false` if it does not exist.
    async fn lock_task(&mut self, task_id: i32) -> Result<bool, AppError>;

    async fn insert_task(&mut self, task: &NewTask, created_by: i32) -> Result<i32, AppError>;

    /// Applies the column changes to one task. An empty slice is a no-op.
    async fn update_task(&mut self, task_id: i32, updates: &[FieldUpdate]) -> Result<(), AppError>;

    async fn assignments(&mut self, task_id: i32) -> Result<Vec<Assignment>, AppError>;

    async fn insert_assignment(
        &mut self,
        task_id: i32,
        user_id: i32,
        sent_by: i32,
        assigned_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn delete_assignment(&mut self, task_id: i32, user_id: i32) -> Result<(), AppError>;

    /// Removes every edge of the task and returns how many were deleted.
    async fn delete_assignments(&mut self, task_id: i32) -> Result<u64, AppError>;

    /// Deletes the task row and returns how many rows were deleted.
    async fn delete_task(&mut self, task_id: i32) -> Result<u64, AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;

    async fn rollback(self: Box<Self>) -> Result<(), AppError>;
}

/// Error for a user id that no account carries.
pub(crate) fn unknown_user(user_id: i32) -> AppError {
    AppError::ValidationError(format!("Unknown user id {}", user_id))
}

pub(crate) fn user_in_use(user_id: i32) -> AppError {
    AppError::BadRequest(format!(
        "User {} created or sent tasks and cannot be deleted",
        user_id
    ))
}

pub(crate) fn user_not_found(user_id: i32) -> AppError {
    AppError::NotFound(format!("User {} not found", user_id))
}

/// Expands a full set of scalar fields into column updates.
pub fn full_update(task: &NewTask) -> Vec<FieldUpdate> {
    vec![
        FieldUpdate::Title(task.title.clone()),
        FieldUpdate::Description(task.description.clone()),
        FieldUpdate::DueDate(task.due_date),
        FieldUpdate::Priority(task.priority.clone()),
        FieldUpdate::FilePath(task.file_path.clone()),
    ]
}
