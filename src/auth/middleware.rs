use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    web, Error, HttpMessage,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::fmt;
use std::rc::Rc;

use super::service::AuthService;
use super::token::Claims;
use crate::error::AppError;
use crate::models::Role;

/// Why the gate turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    MissingHeader,
    MalformedHeader,
    InvalidToken,
    RevokedToken,
    InsufficientRole,
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            GateRejection::MissingHeader => "Authorization header required",
            GateRejection::MalformedHeader => "Invalid Authorization header format",
            GateRejection::InvalidToken => "Invalid token",
            GateRejection::RevokedToken => "Token has been revoked",
            GateRejection::InsufficientRole => "Access denied",
        };
        f.write_str(msg)
    }
}

impl From<GateRejection> for AppError {
    fn from(rejection: GateRejection) -> AppError {
        match rejection {
            GateRejection::InsufficientRole => AppError::Forbidden(rejection.to_string()),
            _ => AppError::Unauthorized(rejection.to_string()),
        }
    }
}

/// The raw bearer token of an admitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct BearerToken(pub String);

/// Reads the `Authorization` header as text. A value with bytes outside visible ASCII is
/// malformed, not missing.
pub fn authorization_value(headers: &header::HeaderMap) -> Result<Option<&str>, GateRejection> {
    headers
        .get(header::AUTHORIZATION)
        .map(|value| value.to_str().map_err(|_| GateRejection::MalformedHeader))
        .transpose()
}

/// Splits an `Authorization` value of the form `Bearer <token>`.
pub fn parse_bearer(header_value: Option<&str>) -> Result<&str, GateRejection> {
    let value = header_value
        .filter(|value| !value.is_empty())
        .ok_or(GateRejection::MissingHeader)?;

    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Ok(token),
        _ => Err(GateRejection::MalformedHeader),
    }
}

/// Runs the admission steps in order: header, signature, revocation, role.
pub fn admit(
    auth: &AuthService,
    header_value: Option<&str>,
    required_role: Option<Role>,
) -> Result<(Claims, BearerToken), GateRejection> {
    let token = parse_bearer(header_value)?;

    let claims = auth
        .verify_token(token)
        .map_err(|_| GateRejection::InvalidToken)?;

    if auth.is_token_revoked(token) {
        return Err(GateRejection::RevokedToken);
    }

    if let Some(role) = required_role {
        if claims.role != role {
            return Err(GateRejection::InsufficientRole);
        }
    }

    Ok((claims, BearerToken(token.to_string())))
}

/// Middleware guarding a scope. On success the request carries [`Claims`] and
/// [`BearerToken`] in its extensions.
pub struct RequestGate {
    auth: web::Data<AuthService>,
    required_role: Option<Role>,
}

impl RequestGate {
    /// Admits any holder of a valid, unrevoked token.
    pub fn authenticated(auth: web::Data<AuthService>) -> Self {
        Self {
            auth,
            required_role: None,
        }
    }

    /// Additionally requires the token's role to be `role`.
    pub fn require_role(auth: web::Data<AuthService>, role: Role) -> Self {
        Self {
            auth,
            required_role: Some(role),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequestGateService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestGateService {
            service: Rc::new(service),
            auth: self.auth.clone(),
            required_role: self.required_role,
        }))
    }
}

pub struct RequestGateService<S> {
    service: Rc<S>,
    auth: web::Data<AuthService>,
    required_role: Option<Role>,
}

impl<S, B> Service<ServiceRequest> for RequestGateService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let admitted = authorization_value(req.headers())
            .and_then(|header_value| admit(&self.auth, header_value, self.required_role));

        match admitted {
            Ok((claims, token)) => {
                log::debug!("Admitted user {} ({}) to {}", claims.user_id, claims.role, req.path());
                req.extensions_mut().insert(claims);
                req.extensions_mut().insert(token);
                let service = Rc::clone(&self.service);
                Box::pin(async move { service.call(req).await })
            }
            Err(rejection) => {
                log::warn!("Rejected request to {}: {}", req.path(), rejection);
                let app_err: AppError = rejection.into();
                Box::pin(async move { Err(app_err.into()) })
            }
        }
    }
}
