//! Shared-secret check for control requests
//!
//! Runs before any forwarding operation is invoked; the engine itself has no
//! notion of authentication.

use tracing::warn;

use crate::error::ApiError;

/// Verify the `auth` parameter against the configured secret
pub fn verify_secret(expected: &str, provided: Option<&str>) -> Result<(), ApiError> {
    let provided = provided.ok_or_else(|| {
        warn!("request no auth");
        ApiError::Unauthorized("request no auth".to_string())
    })?;

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        warn!("request auth failed");
        return Err(ApiError::Unauthorized("request auth failed".to_string()));
    }

    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
