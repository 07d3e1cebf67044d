use actix_web::dev::Payload;
use actix_web::{Error as ActixError, FromRequest, HttpMessage, HttpRequest};
use std::future::{ready, Ready};

use super::middleware::BearerToken;
use super::token::Claims;
use crate::error::AppError;

/// Claims of the caller, as attached by `RequestGate`.
///
/// Only usable on routes behind the gate; elsewhere extraction fails with `Unauthorized`.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Claims);

impl AuthenticatedUser {
    pub fn id(&self) -> i32 {
        self.0.user_id
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = ActixError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        match req.extensions().get::<Claims>().cloned() {
            Some(claims) => ready(Ok(AuthenticatedUser(claims))),
            None => {
                let err = AppError::Unauthorized(
                    "Claims not found in request. Ensure RequestGate is active.".to_string(),
                );
                ready(Err(err.into()))
            }
        }
    }
}

impl FromRequest for BearerToken {
    type Error = ActixError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        match req.extensions().get::<BearerToken>().cloned() {
            Some(token) => ready(Ok(token)),
            None => ready(Err(AppError::Unauthorized("Missing token".into()).into())),
        }
    }
}
