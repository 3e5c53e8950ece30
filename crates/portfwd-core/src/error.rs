use std::time::Duration;
use thiserror::Error;

/// Errors produced by the forwarding engine
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to connect to target {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("Timed out after {timeout:?} connecting to target {target}")]
    DialTimeout { target: String, timeout: Duration },

    #[error("Relay stream error: {0}")]
    Stream(std::io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwardError {
    /// Whether the error aborted a start attempt (as opposed to a single connection)
    pub fn is_bind_error(&self) -> bool {
        matches!(self, ForwardError::Bind { .. } | ForwardError::InvalidAddress(_))
    }

    /// Whether the error was raised while dialing the target
    pub fn is_dial_error(&self) -> bool {
        matches!(
            self,
            ForwardError::Dial { .. } | ForwardError::DialTimeout { .. }
        )
    }
}
