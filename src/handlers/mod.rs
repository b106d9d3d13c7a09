//! # HTTP Request Handlers
//!
//! The request/response surface over the job engine: audio submission,
//! status polling, cancellation, and runtime configuration.
//!
//! Authentication itself lives in front of this service; the fronting
//! proxy injects the authenticated principal as the `X-User-Id` header and
//! every handler treats that identity as the owner for access checks.

pub mod config;
pub mod status;
pub mod transcribe;

pub use config::*;
pub use status::*;
pub use transcribe::*;

use crate::error::{AppError, AppResult};
use actix_web::HttpRequest;

/// Header carrying the authenticated principal, set by the fronting proxy.
pub const IDENTITY_HEADER: &str = "X-User-Id";

/// Extract the caller's identity or reject the request.
pub fn require_identity(req: &HttpRequest) -> AppResult<String> {
    req.headers()
        .get(IDENTITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))
}
