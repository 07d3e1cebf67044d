pub mod extractors;
pub mod middleware;
pub mod password;
pub mod revocation;
pub mod service;
pub mod token;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::Role;

// Re-export necessary items
pub use extractors::AuthenticatedUser;
pub use middleware::{admit, BearerToken, GateRejection, RequestGate};
pub use password::{hash_password, verify_password};
pub use revocation::RevocationStore;
pub use service::AuthService;
pub use token::{Claims, TokenCodec};

/// Represents the payload for a user login request.
#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    pub username: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

/// Response structure after a successful login.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Bearer token for subsequent requests.
    pub token: String,
    pub user_id: i32,
    pub username: String,
    pub role: Role,
}
