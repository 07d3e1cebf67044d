//! Task reconciliation engine.
//!
//! Every write runs in one store transaction. The task row is locked first, so concurrent
//! writes to the same task serialize while different tasks proceed independently. The
//! assignment set is re-read inside the transaction on every call; nothing is cached.
//!
//! Full updates and partial updates share one reconciliation strategy: edges to users
//! that stay assigned are never touched, so their `sent_by` and `assigned_at` survive.

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::{FieldUpdate, TaskDetails, TaskInput, TaskPatch};
use crate::store::{full_update, TaskStore, TaskTransaction};

/// What a reconciliation changed, in ascending user-id order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub added: Vec<i32>,
    pub removed: Vec<i32>,
    pub retained: Vec<i32>,
}

impl Reconciliation {
    /// Diffs the current assignment set against the desired one.
    pub fn plan(current: &BTreeSet<i32>, desired: &BTreeSet<i32>) -> Self {
        Self {
            added: desired.difference(current).copied().collect(),
            removed: current.difference(desired).copied().collect(),
            retained: current.intersection(desired).copied().collect(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Creates a task and assigns it to every listed user with `sent_by = created_by`.
    ///
    /// The task row and all of its assignments are written atomically.
    pub async fn create_task(&self, input: TaskInput, created_by: i32) -> Result<i32, AppError> {
        let (task, user_ids) = input.into_parts()?;

        let mut tx = self.store.begin().await?;
        let result: Result<i32, AppError> = async {
            let task_id = tx.insert_task(&task, created_by).await?;
            let assigned_at = Utc::now();
            for user_id in &user_ids {
                tx.insert_assignment(task_id, *user_id, created_by, assigned_at)
                    .await?;
            }
            Ok(task_id)
        }
        .await;

        let task_id = finish(tx, result).await?;
        info!(
            "Task {} created by user {} and assigned to {:?}",
            task_id, created_by, user_ids
        );
        Ok(task_id)
    }

    /// Replaces every scalar field of the task and reconciles its assignment set to
    /// `input.user_ids`.
    ///
    /// Input is validated before anything is written; any later failure rolls the whole
    /// update back.
    pub async fn update_task(
        &self,
        task_id: i32,
        input: TaskInput,
        acting_user: i32,
    ) -> Result<Reconciliation, AppError> {
        let (task, desired) = input.into_parts()?;
        let updates = full_update(&task);

        let mut tx = self.store.begin().await?;
        let result: Result<Reconciliation, AppError> = async {
            lock_existing(tx.as_mut(), task_id).await?;
            tx.update_task(task_id, &updates).await?;
            reconcile(tx.as_mut(), task_id, &desired, acting_user).await
        }
        .await;

        let plan = finish(tx, result).await?;
        info!(
            "Task {} updated by user {}: added {:?}, removed {:?}",
            task_id, acting_user, plan.added, plan.removed
        );
        Ok(plan)
    }

    /// Applies the fields present in `patch`.
    ///
    /// Without scalar fields no row update is issued. When `user_ids` is present the
    /// assignment set is reconciled exactly as in [`update_task`](Self::update_task) and
    /// the result is returned.
    pub async fn patch_task(
        &self,
        task_id: i32,
        patch: TaskPatch,
        acting_user: i32,
    ) -> Result<Option<Reconciliation>, AppError> {
        let (updates, desired) = patch.into_parts()?;

        let mut tx = self.store.begin().await?;
        let result: Result<Option<Reconciliation>, AppError> = async {
            lock_existing(tx.as_mut(), task_id).await?;
            if updates.is_empty() {
                debug!("No scalar fields to patch on task {}", task_id);
            } else {
                tx.update_task(task_id, &updates).await?;
            }
            match &desired {
                Some(desired) => reconcile(tx.as_mut(), task_id, desired, acting_user)
                    .await
                    .map(Some),
                None => Ok(None),
            }
        }
        .await;

        let plan = finish(tx, result).await?;
        info!(
            "Task {} patched by user {} ({})",
            task_id,
            acting_user,
            describe_patch(&updates, plan.as_ref())
        );
        Ok(plan)
    }

    /// Deletes all assignments of the task, then the task itself, in one transaction.
    pub async fn delete_task(&self, task_id: i32) -> Result<(), AppError> {
        let mut tx = self.store.begin().await?;
        let result: Result<u64, AppError> = async {
            lock_existing(tx.as_mut(), task_id).await?;
            let edges = tx.delete_assignments(task_id).await?;
            if tx.delete_task(task_id).await? == 0 {
                return Err(AppError::task_not_found(task_id));
            }
            Ok(edges)
        }
        .await;

        let edges = finish(tx, result).await?;
        info!("Task {} deleted along with {} assignments", task_id, edges);
        Ok(())
    }

    pub async fn get_task(&self, task_id: i32) -> Result<TaskDetails, AppError> {
        let task = self
            .store
            .find_task(task_id)
            .await?
            .ok_or_else(|| AppError::task_not_found(task_id))?;
        let assignments = self.store.assignments(task_id).await?;
        Ok(TaskDetails::new(task, assignments))
    }

    /// Tasks assigned to `user_id`, earliest due date first.
    pub async fn tasks_for_user(&self, user_id: i32) -> Result<Vec<TaskDetails>, AppError> {
        let tasks = self.store.tasks_for_user(user_id).await?;
        let mut details = Vec::with_capacity(tasks.len());
        for task in tasks {
            let assignments = self.store.assignments(task.id).await?;
            details.push(TaskDetails::new(task, assignments));
        }
        debug!("Found {} tasks for user {}", details.len(), user_id);
        Ok(details)
    }
}

async fn lock_existing(tx: &mut dyn TaskTransaction, task_id: i32) -> Result<(), AppError> {
    if tx.lock_task(task_id).await? {
        Ok(())
    } else {
        Err(AppError::task_not_found(task_id))
    }
}

/// Moves the task's assignment set to `desired`. New edges get `sent_by = acting_user`.
async fn reconcile(
    tx: &mut dyn TaskTransaction,
    task_id: i32,
    desired: &BTreeSet<i32>,
    acting_user: i32,
) -> Result<Reconciliation, AppError> {
    let current: BTreeSet<i32> = tx
        .assignments(task_id)
        .await?
        .into_iter()
        .map(|assignment| assignment.user_id)
        .collect();

    let plan = Reconciliation::plan(&current, desired);
    debug!("Task {} current users {:?}, plan {:?}", task_id, current, plan);

    for user_id in &plan.removed {
        tx.delete_assignment(task_id, *user_id).await?;
    }
    let assigned_at = Utc::now();
    for user_id in &plan.added {
        tx.insert_assignment(task_id, *user_id, acting_user, assigned_at)
            .await?;
    }
    Ok(plan)
}

/// Commits on success; on failure rolls back and returns the original error.
async fn finish<T>(tx: Box<dyn TaskTransaction>, result: Result<T, AppError>) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed after '{}': {}", err, rollback_err);
            }
            Err(err)
        }
    }
}

fn describe_patch(updates: &[FieldUpdate], plan: Option<&Reconciliation>) -> String {
    let columns: Vec<&str> = updates.iter().map(FieldUpdate::column).collect();
    match plan {
        Some(plan) => format!(
            "fields {:?}, users added {:?}, removed {:?}",
            columns, plan.added, plan.removed
        ),
        None => format!("fields {:?}", columns),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Assignment, NewTask, Task};
    use crate::store::MemoryTaskStore;
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate};
    use pretty_assertions::assert_eq;

    fn input(user_ids: &[i32]) -> TaskInput {
        TaskInput {
            title: "Report".into(),
            description: "Q1".into(),
            due_date: Some("2024-12-31".into()),
            priority: "High".into(),
            file_path: None,
            user_ids: user_ids.to_vec(),
        }
    }

    fn edges(details: &TaskDetails) -> Vec<(i32, i32)> {
        details
            .assignments
            .iter()
            .map(|a| (a.user_id, a.sent_by))
            .collect()
    }

    fn assignment_of(details: &TaskDetails, user_id: i32) -> Assignment {
        details
            .assignments
            .iter()
            .find(|a| a.user_id == user_id)
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_plan_set_difference() {
        let sets: Vec<BTreeSet<i32>> = vec![
            BTreeSet::new(),
            [1].into(),
            [1, 2, 3].into(),
            [2, 3, 4].into(),
            [5, 6].into(),
        ];
        for current in &sets {
            for desired in &sets {
                let plan = Reconciliation::plan(current, desired);
                let mut result: BTreeSet<i32> = current.clone();
                for id in &plan.removed {
                    assert!(result.remove(id));
                }
                for id in &plan.added {
                    assert!(result.insert(*id));
                }
                assert_eq!(&result, desired);
                assert_eq!(
                    plan.retained,
                    current.intersection(desired).copied().collect::<Vec<_>>()
                );
            }
        }
    }

    #[actix_rt::test]
    async fn test_create_task_assigns_all_users() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let task_id = service.create_task(input(&[1, 2, 3]), 9).await.unwrap();

        let details = service.get_task(task_id).await.unwrap();
        assert_eq!(edges(&details), vec![(1, 9), (2, 9), (3, 9)]);
        assert_eq!(details.task.title, "Report");
        assert_eq!(details.task.description, "Q1");
        assert_eq!(details.task.due_date, NaiveDate::from_ymd_opt(2024, 12, 31));
        assert_eq!(details.task.priority, "High");
        assert_eq!(details.task.created_by, 9);
    }

    #[actix_rt::test]
    async fn test_create_task_collapses_duplicate_users() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let task_id = service.create_task(input(&[2, 2, 1]), 9).await.unwrap();
        assert_eq!(service.get_task(task_id).await.unwrap().user_ids, vec![1, 2]);
    }

    #[actix_rt::test]
    async fn test_update_task_preserves_provenance() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let task_id = service.create_task(input(&[1, 2, 3]), 9).await.unwrap();
        let before = service.get_task(task_id).await.unwrap();

        let mut update = input(&[2, 3, 4]);
        update.title = "Report v2".into();
        let plan = service.update_task(task_id, update, 5).await.unwrap();
        assert_eq!(
            plan,
            Reconciliation {
                added: vec![4],
                removed: vec![1],
                retained: vec![2, 3],
            }
        );

        let after = service.get_task(task_id).await.unwrap();
        assert_eq!(after.task.title, "Report v2");
        assert_eq!(edges(&after), vec![(2, 9), (3, 9), (4, 5)]);
        assert_eq!(assignment_of(&after, 2), assignment_of(&before, 2));
        assert_eq!(assignment_of(&after, 3), assignment_of(&before, 3));
        assert!(assignment_of(&after, 4).assigned_at >= assignment_of(&before, 3).assigned_at);
    }

    #[actix_rt::test]
    async fn test_update_task_same_actor_scenario() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let task_id = service.create_task(input(&[1, 2, 3]), 9).await.unwrap();

        service.update_task(task_id, input(&[2, 3, 4]), 9).await.unwrap();

        let after = service.get_task(task_id).await.unwrap();
        assert_eq!(edges(&after), vec![(2, 9), (3, 9), (4, 9)]);
    }

    #[actix_rt::test]
    async fn test_update_task_is_idempotent() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let task_id = service.create_task(input(&[1, 2]), 9).await.unwrap();

        service.update_task(task_id, input(&[2, 3]), 4).await.unwrap();
        let first = service.get_task(task_id).await.unwrap();

        let plan = service.update_task(task_id, input(&[3, 2, 3]), 6).await.unwrap();
        assert!(plan.is_noop());
        assert_eq!(service.get_task(task_id).await.unwrap(), first);
    }

    #[actix_rt::test]
    async fn test_failed_validation_leaves_task_unchanged() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let task_id = service.create_task(input(&[1, 2, 3]), 9).await.unwrap();
        let before = service.get_task(task_id).await.unwrap();

        let mut bad = input(&[4]);
        bad.due_date = Some("2024-31-12".into());
        assert!(matches!(
            service.update_task(task_id, bad, 9).await,
            Err(AppError::ValidationError(_))
        ));

        let mut bad = input(&[4]);
        bad.description = String::new();
        assert!(service.update_task(task_id, bad, 9).await.is_err());

        assert_eq!(service.get_task(task_id).await.unwrap(), before);
    }

    #[actix_rt::test]
    async fn test_update_missing_task_is_not_found() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        assert!(matches!(
            service.update_task(42, input(&[1]), 9).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.patch_task(42, TaskPatch::default(), 9).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(service.delete_task(42).await, Err(AppError::NotFound(_))));
        assert!(matches!(service.get_task(42).await, Err(AppError::NotFound(_))));
    }

    #[actix_rt::test]
    async fn test_patch_user_ids_only() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let task_id = service.create_task(input(&[1, 2, 3]), 9).await.unwrap();
        let before = service.get_task(task_id).await.unwrap();

        let patch = TaskPatch {
            user_ids: Some(vec![3, 7]),
            ..Default::default()
        };
        let plan = service.patch_task(task_id, patch, 5).await.unwrap().unwrap();
        assert_eq!(plan.added, vec![7]);
        assert_eq!(plan.removed, vec![1, 2]);

        let after = service.get_task(task_id).await.unwrap();
        assert_eq!(after.task, before.task);
        assert_eq!(edges(&after), vec![(3, 9), (7, 5)]);
        assert_eq!(assignment_of(&after, 3), assignment_of(&before, 3));
    }

    #[actix_rt::test]
    async fn test_patch_scalars_only() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let task_id = service.create_task(input(&[1]), 9).await.unwrap();
        let before = service.get_task(task_id).await.unwrap();

        let patch = TaskPatch {
            priority: Some("Low".into()),
            due_date: Some(String::new()),
            file_path: Some("uploads/171.pdf".into()),
            ..Default::default()
        };
        assert_eq!(service.patch_task(task_id, patch, 5).await.unwrap(), None);

        let after = service.get_task(task_id).await.unwrap();
        assert_eq!(after.task.priority, "Low");
        assert_eq!(after.task.due_date, None);
        assert_eq!(after.task.file_path.as_deref(), Some("uploads/171.pdf"));
        assert_eq!(after.task.title, before.task.title);
        assert_eq!(after.assignments, before.assignments);

        // Nothing to change is still a success.
        assert_eq!(
            service.patch_task(task_id, TaskPatch::default(), 5).await.unwrap(),
            None
        );
    }

    #[actix_rt::test]
    async fn test_delete_task_removes_edges() {
        let store = Arc::new(MemoryTaskStore::new());
        let service = TaskService::new(store.clone());
        let task_id = service.create_task(input(&[1, 2]), 9).await.unwrap();
        let other = service.create_task(input(&[1]), 9).await.unwrap();

        service.delete_task(task_id).await.unwrap();

        assert!(store.find_task(task_id).await.unwrap().is_none());
        assert!(store.assignments(task_id).await.unwrap().is_empty());
        let remaining = service.tasks_for_user(1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task.id, other);
    }

    #[actix_rt::test]
    async fn test_tasks_for_user_ordered_by_due_date() {
        let service = TaskService::new(Arc::new(MemoryTaskStore::new()));
        let mut late = input(&[1]);
        late.due_date = Some("2025-06-01".into());
        let mut undated = input(&[1]);
        undated.due_date = None;
        let late_id = service.create_task(late, 9).await.unwrap();
        let undated_id = service.create_task(undated, 9).await.unwrap();
        let early_id = service.create_task(input(&[1, 2]), 9).await.unwrap();

        let ids: Vec<i32> = service
            .tasks_for_user(1)
            .await
            .unwrap()
            .iter()
            .map(|d| d.task.id)
            .collect();
        assert_eq!(ids, vec![early_id, late_id, undated_id]);
        assert_eq!(service.tasks_for_user(2).await.unwrap().len(), 1);
        assert!(service.tasks_for_user(3).await.unwrap().is_empty());
    }

    /// Where the wrapped transaction should fail.
    #[derive(Clone, Copy)]
    enum FailPoint {
        InsertAssignment(i32),
        DeleteTask,
    }

    struct FailingStore {
        inner: MemoryTaskStore,
        fail: FailPoint,
    }

    struct FailingTx {
        inner: Box<dyn TaskTransaction>,
        fail: FailPoint,
    }

    #[async_trait]
    impl TaskStore for FailingStore {
        async fn begin(&self) -> Result<Box<dyn TaskTransaction>, AppError> {
            Ok(Box::new(FailingTx {
                inner: self.inner.begin().await?,
                fail: self.fail,
            }))
        }

        async fn find_task(&self, task_id: i32) -> Result<Option<Task>, AppError> {
            self.inner.find_task(task_id).await
        }

        async fn assignments(&self, task_id: i32) -> Result<Vec<Assignment>, AppError> {
            self.inner.assignments(task_id).await
        }

        async fn tasks_for_user(&self, user_id: i32) -> Result<Vec<Task>, AppError> {
            self.inner.tasks_for_user(user_id).await
        }
    }

    #[async_trait]
    impl TaskTransaction for FailingTx {
        async fn lock_task(&mut self, task_id: i32) -> Result<bool, AppError> {
            self.inner.lock_task(task_id).await
        }

        async fn insert_task(&mut self, task: &NewTask, created_by: i32) -> Result<i32, AppError> {
            self.inner.insert_task(task, created_by).await
        }

        async fn update_task(
            &mut self,
            task_id: i32,
            updates: &[FieldUpdate],
        ) -> Result<(), AppError> {
            self.inner.update_task(task_id, updates).await
        }

        async fn assignments(&mut self, task_id: i32) -> Result<Vec<Assignment>, AppError> {
            self.inner.assignments(task_id).await
        }

        async fn insert_assignment(
            &mut self,
            task_id: i32,
            user_id: i32,
            sent_by: i32,
            assigned_at: DateTime<Utc>,
        ) -> Result<(), AppError> {
            if matches!(self.fail, FailPoint::InsertAssignment(id) if id == user_id) {
                return Err(AppError::DatabaseError(format!(
                    "Failed to assign task to user {}: injected",
                    user_id
                )));
            }
            self.inner
                .insert_assignment(task_id, user_id, sent_by, assigned_at)
                .await
        }

        async fn delete_assignment(&mut self, task_id: i32, user_id: i32) -> Result<(), AppError> {
            self.inner.delete_assignment(task_id, user_id).await
        }

        async fn delete_assignments(&mut self, task_id: i32) -> Result<u64, AppError> {
            self.inner.delete_assignments(task_id).await
        }

        async fn delete_task(&mut self, task_id: i32) -> Result<u64, AppError> {
            if matches!(self.fail, FailPoint::DeleteTask) {
                return Err(AppError::DatabaseError("Failed to delete task: injected".into()));
            }
            self.inner.delete_task(task_id).await
        }

        async fn commit(self: Box<Self>) -> Result<(), AppError> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), AppError> {
            self.inner.rollback().await
        }
    }

    #[actix_rt::test]
    async fn test_create_task_is_all_or_nothing() {
        let inner = MemoryTaskStore::new();
        let service = TaskService::new(Arc::new(FailingStore {
            inner: inner.clone(),
            fail: FailPoint::InsertAssignment(3),
        }));

        assert!(matches!(
            service.create_task(input(&[1, 2, 3]), 9).await,
            Err(AppError::DatabaseError(_))
        ));
        assert!(inner.find_task(1).await.unwrap().is_none());
        assert!(inner.tasks_for_user(1).await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_failed_reconciliation_rolls_back() {
        let inner = MemoryTaskStore::new();
        let task_id = TaskService::new(Arc::new(inner.clone()))
            .create_task(input(&[1, 2, 3]), 9)
            .await
            .unwrap();
        let service = TaskService::new(Arc::new(FailingStore {
            inner: inner.clone(),
            fail: FailPoint::InsertAssignment(4),
        }));
        let before = service.get_task(task_id).await.unwrap();

        let mut update = input(&[2, 3, 4]);
        update.title = "Should not stick".into();
        assert!(service.update_task(task_id, update, 5).await.is_err());
        assert_eq!(service.get_task(task_id).await.unwrap(), before);

        let patch = TaskPatch {
            title: Some("Nor this".into()),
            user_ids: Some(vec![4]),
            ..Default::default()
        };
        assert!(service.patch_task(task_id, patch, 5).await.is_err());
        assert_eq!(service.get_task(task_id).await.unwrap(), before);
    }

    #[actix_rt::test]
    async fn test_failed_delete_keeps_edges() {
        let inner = MemoryTaskStore::new();
        let task_id = TaskService::new(Arc::new(inner.clone()))
            .create_task(input(&[1, 2]), 9)
            .await
            .unwrap();
        let service = TaskService::new(Arc::new(FailingStore {
            inner: inner.clone(),
            fail: FailPoint::DeleteTask,
        }));

        assert!(service.delete_task(task_id).await.is_err());
        assert_eq!(inner.assignments(task_id).await.unwrap().len(), 2);
        assert!(inner.find_task(task_id).await.unwrap().is_some());
    }
}
