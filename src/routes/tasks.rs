use crate::{
    auth::AuthenticatedUser,
    error::AppError,
    models::{TaskDetails, TaskInput, TaskPatch},
    tasks::{Reconciliation, TaskService},
};
use actix_web::{delete, get, patch, post, put, web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

/// Body returned by the write endpoints: the task as it now stands and, when the
/// assignment set was reconciled, what changed.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskWriteResponse {
    pub task: TaskDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignments: Option<Reconciliation>,
}

/// Creates a task and assigns it to `user_ids`.
///
/// Every new assignment records the caller as `sent_by`.
///
/// ## Responses:
/// - `201 Created`: the task with its assignments.
/// - `422 Unprocessable Entity`: missing title/description, bad due date or user ids.
#[post("/tasks")]
pub async fn create_task(
    tasks: web::Data<TaskService>,
    user: AuthenticatedUser,
    task_data: web::Json<TaskInput>,
) -> Result<impl Responder, AppError> {
    let task_id = tasks.create_task(task_data.into_inner(), user.id()).await?;
    let task = tasks.get_task(task_id).await?;
    Ok(HttpResponse::Created().json(task))
}

#[get("/tasks/{id}")]
pub async fn get_task(
    tasks: web::Data<TaskService>,
    task_id: web::Path<i32>,
) -> Result<impl Responder, AppError> {
    let task = tasks.get_task(task_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(task))
}

/// Replaces all task attributes and reconciles assignments to `user_ids`.
///
/// Users that stay assigned keep their original `sent_by` and `assigned_at`.
///
/// ## Responses:
/// - `200 OK`: the updated task plus the added/removed/retained user ids.
/// - `404 Not Found`: no such task.
/// - `422 Unprocessable Entity`: invalid input; nothing was written.
#[put("/tasks/{id}")]
pub async fn update_task(
    tasks: web::Data<TaskService>,
    user: AuthenticatedUser,
    task_id: web::Path<i32>,
    task_data: web::Json<TaskInput>,
) -> Result<impl Responder, AppError> {
    let task_id = task_id.into_inner();
    let plan = tasks
        .update_task(task_id, task_data.into_inner(), user.id())
        .await?;
    let task = tasks.get_task(task_id).await?;
    Ok(HttpResponse::Ok().json(TaskWriteResponse {
        task,
        assignments: Some(plan),
    }))
}

/// Updates only the fields present in the body. Unknown fields are rejected.
#[patch("/tasks/{id}")]
pub async fn patch_task(
    tasks: web::Data<TaskService>,
    user: AuthenticatedUser,
    task_id: web::Path<i32>,
    patch: web::Json<TaskPatch>,
) -> Result<impl Responder, AppError> {
    let task_id = task_id.into_inner();
    let plan = tasks
        .patch_task(task_id, patch.into_inner(), user.id())
        .await?;
    let task = tasks.get_task(task_id).await?;
    Ok(HttpResponse::Ok().json(TaskWriteResponse {
        task,
        assignments: plan,
    }))
}

/// Deletes a task and all of its assignments.
///
/// ## Responses:
/// - `204 No Content`: deleted.
/// - `404 Not Found`: no such task.
#[delete("/tasks/{id}")]
pub async fn delete_task(
    tasks: web::Data<TaskService>,
    task_id: web::Path<i32>,
) -> Result<impl Responder, AppError> {
    tasks.delete_task(task_id.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Tasks assigned to the caller, earliest due date first.
#[get("/tasks")]
pub async fn my_tasks(
    tasks: web::Data<TaskService>,
    user: AuthenticatedUser,
) -> Result<impl Responder, AppError> {
    let assigned = tasks.tasks_for_user(user.id()).await?;
    Ok(HttpResponse::Ok().json(assigned))
}
