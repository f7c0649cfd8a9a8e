//! Error taxonomy for the Sydpower cloud client.
//!
//! Network and timeout errors are transient and absorbed by retry/reconnection
//! logic; auth and validation errors are fatal for the operation that raised
//! them and surface to the caller unchanged.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the API client, MQTT session, and connector.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient transport failure (HTTP, WebSocket, MQTT broker refused).
    /// Recovered by retry or reconnection.
    #[error("network error: {0}")]
    Network(String),

    /// A bounded wait elapsed. Treated like a network error for retry
    /// decisions in I/O contexts.
    #[error("timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Credentials rejected or a token absent from the response. Fatal for
    /// the current session.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The RPC returned a malformed or unexpected body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Write refused by the register allowlist. Never retried; the frame is
    /// never published.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No devices, unknown command, session gone mid-operation.
    #[error("{0}")]
    State(String),
}

impl Error {
    pub(crate) fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Error::Timeout { operation, timeout }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout {
                operation: "HTTP request",
                timeout: Duration::ZERO,
            }
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(err: rumqttc::ClientError) -> Self {
        Error::Network(err.to_string())
    }
}

/// A write frame refused before encoding. Carries enough structure for the
/// caller to report exactly what was rejected and why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The register is not in the writable-register allowlist at all.
    #[error("register {0} is not writable")]
    UnknownRegister(u16),

    /// The register is writable but the value is outside its permitted set.
    #[error("value {value} not allowed for register {register} (allowed: {allowed})")]
    ValueOutOfRange {
        register: u16,
        value: u16,
        allowed: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_register_and_allowed_set() {
        let err = ValidationError::ValueOutOfRange {
            register: 27,
            value: 4,
            allowed: "{0, 1, 2, 3}".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("27"));
        assert!(msg.contains('4'));
        assert!(msg.contains("{0, 1, 2, 3}"));
    }

    #[test]
    fn unknown_register_names_register() {
        let err = ValidationError::UnknownRegister(56);
        assert!(err.to_string().contains("56"));
    }
}
