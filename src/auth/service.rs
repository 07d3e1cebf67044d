use lazy_static::lazy_static;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::password::{hash_password, verify_password};
use super::revocation::RevocationStore;
use super::token::{Claims, TokenCodec};
use crate::error::AppError;
use crate::models::{Role, User};
use crate::shutdown::Cancellation;
use crate::store::UserStore;

/// The one error every failed login produces.
pub const INVALID_CREDENTIALS: &str = "Invalid credentials";

lazy_static! {
    // Checked against when the username is unknown, so every login pays one bcrypt verify
    // at the cost real accounts are hashed with.
    static ref UNKNOWN_USER_HASH: Option<String> = hash_password("taskhub-unknown-user").ok();
}

/// Runs a bcrypt operation on the blocking pool.
async fn run_blocking<T, F>(op: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| AppError::InternalServerError(format!("Password task failed: {}", e)))?
}

/// Front door for credentials, session tokens and revocation.
///
/// Build exactly one per process and share it (`web::Data` / `Arc`) with every consumer;
/// a second instance would carry its own revocation set.
pub struct AuthService {
    users: Arc<dyn UserStore>,
    codec: TokenCodec,
    revocations: Arc<RevocationStore>,
    failed_login_delay: Duration,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, codec: TokenCodec, failed_login_delay: Duration) -> Self {
        lazy_static::initialize(&UNKNOWN_USER_HASH);
        Self {
            users,
            codec,
            revocations: Arc::new(RevocationStore::new()),
            failed_login_delay,
        }
    }

    /// Checks a username/password pair.
    ///
    /// Unknown usernames and wrong passwords both run one bcrypt verify, wait
    /// `failed_login_delay` and return the same `Unauthorized` error.
    pub async fn authenticate_user(&self, username: &str, password: &str) -> Result<User, AppError> {
        let record = self.users.find_by_username(username).await?;

        let stored_hash = match &record {
            Some(record) => Some(record.password_hash.clone()),
            None => UNKNOWN_USER_HASH.clone(),
        };
        let matched = match stored_hash {
            Some(stored_hash) => {
                let password = password.to_string();
                run_blocking(move || Ok(verify_password(&password, &stored_hash)))
                    .await?
                    .unwrap_or_else(|e| {
                        warn!("Unreadable password hash for user '{}': {}", username, e);
                        false
                    })
            }
            None => false,
        };

        match record {
            Some(record) if matched => Ok(record.to_user()),
            _ => {
                warn!("Failed login attempt for user '{}'", username);
                tokio::time::sleep(self.failed_login_delay).await;
                Err(AppError::Unauthorized(INVALID_CREDENTIALS.into()))
            }
        }
    }

    pub fn issue_token(&self, user: &User) -> Result<String, AppError> {
        self.codec.issue(user.id, &user.username, user.role)
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, AppError> {
        self.codec.verify(token)
    }

    /// Revokes `token` unless `ctx` has already been cancelled, in which case nothing is
    /// written.
    pub fn revoke_token(&self, token: &str, ctx: &Cancellation) -> Result<(), AppError> {
        if ctx.is_cancelled() {
            return Err(AppError::Cancelled(
                "Context cancelled before the token could be revoked".into(),
            ));
        }
        self.revocations.revoke(token);
        info!("Token revoked ({} revoked tokens held)", self.revocations.len());
        Ok(())
    }

    pub fn is_token_revoked(&self, token: &str) -> bool {
        self.revocations.is_revoked(token)
    }

    /// Creates an admin account named `username` unless one with that name exists.
    /// Returns whether an account was created.
    pub async fn ensure_admin(&self, username: &str, password: &str) -> Result<bool, AppError> {
        if self.users.find_by_username(username).await?.is_some() {
            return Ok(false);
        }
        let password = password.to_string();
        let hash = run_blocking(move || hash_password(&password)).await?;
        self.users.create_user(username, &hash, Role::Admin).await?;
        info!("Bootstrap admin '{}' created", username);
        Ok(true)
    }

    /// Starts the background sweep of expired revocations.
    pub fn spawn_revocation_sweeper(&self, period: Duration, shutdown: Cancellation) -> JoinHandle<()> {
        self.revocations
            .spawn_sweeper(self.codec.clone(), period, shutdown)
    }
}
