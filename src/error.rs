//! Error types for the binding layer.
//!
//! Two families of failure reach the host: errors reported by the native
//! library ([`NativeError`], carrying its domain and numeric code) and errors
//! raised by the binding itself before any native call is made (bad
//! arguments, closed databases, stale handles).

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::listener::ListenerKind;

/// Result type alias for binding operations.
pub type BindingResult<T> = Result<T, BindingError>;

/// Error domain reported by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorDomain {
    CouchbaseLite,
    Posix,
    Sqlite,
    Fleece,
    Network,
    WebSocket,
}

impl ErrorDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorDomain::CouchbaseLite => "CouchbaseLite",
            ErrorDomain::Posix => "POSIX",
            ErrorDomain::Sqlite => "SQLite",
            ErrorDomain::Fleece => "Fleece",
            ErrorDomain::Network => "Network",
            ErrorDomain::WebSocket => "WebSocket",
        }
    }
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known native error codes.
pub mod codes {
    pub const NOT_OPEN: i32 = 6;
    pub const NOT_FOUND: i32 = 7;
    pub const CONFLICT: i32 = 8;
    pub const INVALID_PARAMETER: i32 = 9;
    pub const CANT_OPEN_FILE: i32 = 11;
    pub const NOT_WRITEABLE: i32 = 14;
    pub const CORRUPT_DATA: i32 = 15;
    pub const BUSY: i32 = 16;
    pub const NOT_IN_TRANSACTION: i32 = 17;
    pub const TRANSACTION_NOT_CLOSED: i32 = 18;
    pub const UNSUPPORTED: i32 = 19;
    pub const INVALID_QUERY: i32 = 23;
    pub const BAD_DOC_ID: i32 = 29;

    // Network domain
    pub const NET_UNKNOWN_HOST: i32 = 2;
    pub const NET_INVALID_URL: i32 = 4;
}

/// An error reported by the native library.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{domain} error {code}: {message}")]
pub struct NativeError {
    pub domain: ErrorDomain,
    pub code: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(domain: ErrorDomain, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain,
            code,
            message: message.into(),
        }
    }

    /// Shorthand for an error in the Couchbase Lite domain.
    pub fn cbl(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::CouchbaseLite, code, message)
    }

    pub fn network(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Network, code, message)
    }
}

/// The main error type for the binding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindingError {
    /// Wrong argument type or shape; raised before any native call.
    #[error("Wrong arguments: {0}")]
    InvalidArgument(String),

    /// Failure reported by the native library.
    #[error(transparent)]
    Native(#[from] NativeError),

    #[error("Database is closed")]
    DatabaseClosed,

    #[error("Blob stream is closed")]
    StreamClosed,

    /// The handle was already released.
    #[error("{kind} handle has been released")]
    StaleHandle { kind: &'static str },

    #[error("Error adding {kind} listener")]
    ListenerRegistration { kind: ListenerKind },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BindingError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BindingError::InvalidArgument(message.into())
    }

    /// Host-visible error code.
    ///
    /// Native errors render as `Domain:code` so callers can tell storage,
    /// query and network failures apart; binding errors use fixed codes.
    pub fn code(&self) -> String {
        match self {
            BindingError::Native(e) => format!("{}:{}", e.domain, e.code),
            BindingError::InvalidArgument(_) => "ERR_INVALID_ARG_TYPE".to_string(),
            BindingError::DatabaseClosed => "ERR_DATABASE_CLOSED".to_string(),
            BindingError::StreamClosed => "ERR_STREAM_CLOSED".to_string(),
            BindingError::StaleHandle { .. } => "ERR_STALE_HANDLE".to_string(),
            BindingError::ListenerRegistration { .. } => "ERR_LISTENER".to_string(),
            BindingError::Unsupported(_) => "ERR_UNSUPPORTED".to_string(),
            BindingError::Config(_) => "ERR_CONFIG".to_string(),
        }
    }

    /// Whether the host should raise this as a type error.
    pub fn is_type_error(&self) -> bool {
        matches!(self, BindingError::InvalidArgument(_))
    }

    /// The native error, if this came from the native library.
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            BindingError::Native(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_codes_carry_domain() {
        let err: BindingError = NativeError::network(codes::NET_UNKNOWN_HOST, "no such host").into();
        assert_eq!(err.code(), "Network:2");
        assert_eq!(err.to_string(), "Network error 2: no such host");

        let err: BindingError = NativeError::cbl(codes::INVALID_QUERY, "bad query").into();
        assert_eq!(err.code(), "CouchbaseLite:23");
        assert!(!err.is_type_error());
    }

    #[test]
    fn binding_errors_have_stable_codes() {
        assert_eq!(BindingError::DatabaseClosed.code(), "ERR_DATABASE_CLOSED");
        assert_eq!(BindingError::DatabaseClosed.to_string(), "Database is closed");
        assert!(BindingError::invalid_argument("x").is_type_error());
        assert!(BindingError::StreamClosed.native().is_none());
    }
}
