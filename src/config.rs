use std::env;
use std::time::Duration;

use crate::auth::revocation::DEFAULT_SWEEP_INTERVAL;
use crate::error::AppError;

/// Runtime configuration, read from the process environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. When unset the server runs on in-memory stores.
    pub database_url: Option<String>,
    pub server_port: u16,
    pub server_host: String,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub revocation_sweep_interval: Duration,
    pub failed_login_delay: Duration,
    /// Credentials of an admin account created at startup if it does not exist yet.
    pub bootstrap_admin: Option<(String, String)>,
    /// Empty means any origin.
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| config_error("JWT_SECRET must be set"))?;

        let bootstrap_admin = match (lookup("ADMIN_USERNAME"), lookup("ADMIN_PASSWORD")) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        };

        let token_ttl_secs = parse_or(&lookup, "TOKEN_TTL_HOURS", 24u64)?
            .checked_mul(3600)
            .filter(|secs| i64::try_from(*secs).is_ok())
            .ok_or_else(|| config_error("TOKEN_TTL_HOURS is too large"))?;

        let sweep_interval_secs = parse_or(
            &lookup,
            "REVOCATION_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL.as_secs(),
        )?;
        if sweep_interval_secs == 0 {
            return Err(config_error("REVOCATION_SWEEP_INTERVAL_SECS must be positive"));
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
            server_host: lookup("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            jwt_secret,
            token_ttl: Duration::from_secs(token_ttl_secs),
            revocation_sweep_interval: Duration::from_secs(sweep_interval_secs),
            failed_login_delay: Duration::from_millis(parse_or(
                &lookup,
                "FAILED_LOGIN_DELAY_MS",
                1000u64,
            )?),
            bootstrap_admin,
            cors_allowed_origins: lookup("CORS_ALLOWED_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.server_port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| config_error(&format!("{} must be a number", key))),
        None => Ok(default),
    }
}

fn config_error(msg: &str) -> AppError {
    AppError::InternalServerError(format!("Invalid configuration: {}", msg))
}
