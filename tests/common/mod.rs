#![allow(dead_code)]

use actix_cors::Cors;
use actix_http::Request;
use actix_web::body::MessageBody;
use actix_web::dev::{Service, ServiceResponse};
use actix_web::http::{header, StatusCode};
use actix_web::middleware::Logger;
use actix_web::{test, web, App};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use taskhub::auth::password::hash_password_with_cost;
use taskhub::auth::{AuthResponse, AuthService, TokenCodec};
use taskhub::models::Role;
use taskhub::routes::{self, health};
use taskhub::shutdown::Cancellation;
use taskhub::store::{linked_stores, UserStore};
use taskhub::tasks::TaskService;

pub const PASSWORD: &str = "Password123!";
pub const JWT_SECRET: &str = "integration_test_secret";

/// Seeded accounts, in id order.
pub const ADMIN: (&str, i32) = ("admin", 1);
pub const ALICE: (&str, i32) = ("alice", 2);
pub const BOB: (&str, i32) = ("bob", 3);
pub const CAROL: (&str, i32) = ("carol", 4);
pub const OPS: (&str, i32) = ("ops", 5);

pub struct TestContext {
    pub auth: web::Data<AuthService>,
    pub tasks: web::Data<TaskService>,
    pub users: web::Data<dyn UserStore>,
    pub shutdown: Cancellation,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_login_delay(Duration::from_millis(0)).await
    }

    pub async fn with_login_delay(delay: Duration) -> Self {
        let (users, tasks) = linked_stores();
        let users: Arc<dyn UserStore> = Arc::new(users);
        let hash = hash_password_with_cost(PASSWORD, 4).unwrap();
        for (name, role) in [
            (ADMIN.0, Role::Admin),
            (ALICE.0, Role::User),
            (BOB.0, Role::User),
            (CAROL.0, Role::User),
            (OPS.0, Role::Admin),
        ] {
            users.create_user(name, &hash, role).await.unwrap();
        }

        let auth = web::Data::new(AuthService::new(
            users.clone(),
            TokenCodec::new(JWT_SECRET, Duration::from_secs(3600)),
            delay,
        ));
        TestContext {
            auth,
            tasks: web::Data::new(TaskService::new(Arc::new(tasks))),
            users: web::Data::from(users),
            shutdown: Cancellation::new(),
        }
    }
}

pub async fn init_app(
    ctx: &TestContext,
) -> impl Service<Request, Response = ServiceResponse<impl MessageBody>, Error = actix_web::Error> {
    test::init_service(
        App::new()
            .app_data(ctx.auth.clone())
            .app_data(ctx.tasks.clone())
            .app_data(ctx.users.clone())
            .app_data(web::Data::new(ctx.shutdown.clone()))
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .wrap(Logger::default())
            .service(health::health)
            .service(web::scope("/api").configure(routes::config(ctx.auth.clone()))),
    )
    .await
}

/// Sends the request and returns status and JSON body, whether the response came from a
/// handler or from a middleware rejection.
pub async fn send<S, B>(app: &S, req: Request) -> (StatusCode, Value)
where
    S: Service<Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let (status, bytes) = match test::try_call_service(app, req).await {
        Ok(resp) => {
            let status = resp.status();
            (status, test::read_body(resp).await)
        }
        Err(err) => {
            let resp = err.error_response();
            let status = resp.status();
            let bytes = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
            (status, bytes)
        }
    };
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

pub async fn login<S, B>(app: &S, username: &str) -> AuthResponse
where
    S: Service<Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(json!({ "username": username, "password": PASSWORD }))
        .to_request();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK, "Login failed. Body: {}", body);
    serde_json::from_value(body).unwrap()
}

pub fn bearer(token: &str) -> (header::HeaderName, String) {
    (header::AUTHORIZATION, format!("Bearer {}", token))
}
