use crate::{
    auth::{AuthResponse, AuthService, AuthenticatedUser, BearerToken, LoginRequest},
    error::AppError,
    shutdown::Cancellation,
};
use actix_web::{post, web, HttpResponse, Responder};
use log::info;
use serde_json::json;
use validator::Validate;

/// Login user
///
/// Authenticates a user and returns a session token. Unknown usernames and wrong
/// passwords get the same delayed `401`.
#[post("/login")]
pub async fn login(
    auth: web::Data<AuthService>,
    login_data: web::Json<LoginRequest>,
) -> Result<impl Responder, AppError> {
    login_data.validate()?;

    let user = auth
        .authenticate_user(&login_data.username, &login_data.password)
        .await?;
    let token = auth.issue_token(&user)?;
    info!("User '{}' logged in", user.username);

    Ok(HttpResponse::Ok().json(AuthResponse {
        token,
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// Logout user
///
/// Revokes the bearer token the request was admitted with. Mounted behind the gate.
pub async fn logout(
    auth: web::Data<AuthService>,
    user: AuthenticatedUser,
    token: BearerToken,
    shutdown: web::Data<Cancellation>,
) -> Result<HttpResponse, AppError> {
    auth.revoke_token(&token.0, &shutdown)?;
    info!("User '{}' logged out", user.0.username);
    Ok(HttpResponse::Ok().json(json!({ "message": "Logged out" })))
}
