pub mod auth;
pub mod health;
pub mod tasks;
pub mod users;

use actix_web::web;

use crate::auth::{AuthService, RequestGate};
use crate::models::Role;

/// Mounts the API under the enclosing scope.
///
/// `/auth/login` is open, `/auth/logout` and `/user` need any valid session, `/admin`
/// needs the admin role. The handlers expect `AuthService`, `TaskService`, the user store
/// and the shutdown `Cancellation` as app data.
pub fn config(auth_service: web::Data<AuthService>) -> impl Fn(&mut web::ServiceConfig) {
    move |cfg: &mut web::ServiceConfig| {
        cfg.service(
            web::scope("/auth").service(auth::login).service(
                web::resource("/logout")
                    .wrap(RequestGate::authenticated(auth_service.clone()))
                    .route(web::post().to(auth::logout)),
            ),
        )
        .service(
            web::scope("/admin")
                .wrap(RequestGate::require_role(auth_service.clone(), Role::Admin))
                .service(tasks::create_task)
                .service(tasks::get_task)
                .service(tasks::update_task)
                .service(tasks::patch_task)
                .service(tasks::delete_task)
                .service(users::create_user)
                .service(users::list_users)
                .service(users::delete_user),
        )
        .service(
            web::scope("/user")
                .wrap(RequestGate::authenticated(auth_service.clone()))
                .service(tasks::my_tasks),
        );
    }
}
