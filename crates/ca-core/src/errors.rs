//! Error types for the connectivity abstraction layer
//!
//! [`CaError`] is what the public adapter API returns. [`BindingError`] is what
//! a platform capability binding reports; the adapter maps it into `CaError` at
//! the seams where a binding failure becomes visible to a caller.

use crate::types::{Address, ConnectionHandle};

// ----------------------------------------------------------------------------
// Binding Errors
// ----------------------------------------------------------------------------

/// Failure reported by a platform capability binding
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("Platform binding unavailable: {0}")]
    Unavailable(String),
    #[error("Binding is not enabled")]
    NotEnabled,
    #[error("{operation} failed: {reason}")]
    OperationFailed {
        operation: &'static str,
        reason: String,
    },
    #[error("Unknown connection handle: {0}")]
    UnknownHandle(ConnectionHandle),
    #[error("Unknown peer address: {0}")]
    UnknownAddress(Address),
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BindingError {
    pub fn operation(operation: &'static str, reason: impl ToString) -> Self {
        BindingError::OperationFailed {
            operation,
            reason: reason.to_string(),
        }
    }
}

pub type BindingResult<T> = Result<T, BindingError>;

// ----------------------------------------------------------------------------
// Adapter Errors
// ----------------------------------------------------------------------------

/// Errors returned by the adapter API
#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("Invalid argument: {reason}")]
    Validation { reason: String },
    #[error("Capability binding unavailable: {0}")]
    BindingUnavailable(#[source] BindingError),
    #[error("Adapter is not enabled")]
    AdapterNotEnabled,
    #[error("Connection failed to peer {address}: {reason}")]
    ConnectionFailed { address: Address, reason: String },
    #[error("Allocation failed: {reason}")]
    AllocationFailed { reason: String },
    #[error("Send queue closed")]
    QueueClosed,
    #[error("Send queue full (capacity: {capacity})")]
    QueueFull { capacity: usize },
    #[error("Adapter already initialized")]
    AlreadyInitialized,
    #[error("Adapter not initialized")]
    NotInitialized,
    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl CaError {
    pub fn validation(reason: impl Into<String>) -> Self {
        CaError::Validation {
            reason: reason.into(),
        }
    }

    pub fn connection_failed(address: &Address, reason: impl ToString) -> Self {
        CaError::ConnectionFailed {
            address: address.clone(),
            reason: reason.to_string(),
        }
    }
}

impl From<BindingError> for CaError {
    fn from(err: BindingError) -> Self {
        CaError::BindingUnavailable(err)
    }
}

pub type CaResult<T> = Result<T, CaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_error_wraps_into_unavailable() {
        let err: CaError = BindingError::Unavailable("no radio".to_string()).into();
        assert!(matches!(err, CaError::BindingUnavailable(_)));
        assert_eq!(
            err.to_string(),
            "Capability binding unavailable: Platform binding unavailable: no radio"
        );
    }

    #[test]
    fn test_operation_error_message() {
        let err = BindingError::operation("connect", "refused");
        assert_eq!(err.to_string(), "connect failed: refused");
    }
}
