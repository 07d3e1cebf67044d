use crate::{
    auth::{hash_password, AuthenticatedUser},
    error::AppError,
    models::{User, UserInput},
    store::UserStore,
};
use actix_web::{delete, get, post, web, HttpResponse, Responder};
use log::info;
use serde::Deserialize;
use validator::Validate;

/// Creates an account. The password is bcrypt-hashed off the async workers.
///
/// ## Responses:
/// - `201 Created`: the new user, without its hash.
/// - `400 Bad Request`: username already taken.
/// - `422 Unprocessable Entity`: username or password fails validation.
#[post("/users")]
pub async fn create_user(
    users: web::Data<dyn UserStore>,
    user_data: web::Json<UserInput>,
) -> Result<impl Responder, AppError> {
    user_data.validate()?;
    let UserInput {
        username,
        password,
        role,
    } = user_data.into_inner();

    let password_hash = web::block(move || hash_password(&password))
        .await
        .map_err(|e| AppError::InternalServerError(format!("Password hashing failed: {}", e)))??;

    let record = users.create_user(&username, &password_hash, role).await?;
    info!("Created user '{}' with role {}", record.username, record.role);
    Ok(HttpResponse::Created().json(record.to_user()))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    /// Substring the username must contain.
    pub username: Option<String>,
}

#[get("/users")]
pub async fn list_users(
    users: web::Data<dyn UserStore>,
    query: web::Query<UserQuery>,
) -> Result<impl Responder, AppError> {
    let filter = query.username.as_deref().filter(|part| !part.is_empty());
    let users: Vec<User> = users
        .list_users(filter)
        .await?
        .iter()
        .map(|record| record.to_user())
        .collect();
    Ok(HttpResponse::Ok().json(users))
}

/// Deletes an account together with the assignments it holds.
///
/// Existing tokens of the deleted account stay valid until they expire.
///
/// ## Responses:
/// - `204 No Content`: deleted.
/// - `400 Bad Request`: the caller's own account, or one that created or sent tasks.
/// - `404 Not Found`: no such user.
#[delete("/users/{id}")]
pub async fn delete_user(
    users: web::Data<dyn UserStore>,
    caller: AuthenticatedUser,
    user_id: web::Path<i32>,
) -> Result<impl Responder, AppError> {
    let user_id = user_id.into_inner();
    if user_id == caller.id() {
        return Err(AppError::BadRequest("Cannot delete your own account".into()));
    }
    users.delete_user(user_id).await?;
    info!("User {} deleted by '{}'", user_id, caller.0.username);
    Ok(HttpResponse::NoContent().finish())
}
