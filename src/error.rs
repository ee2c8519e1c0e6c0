//! # Error Types
//!
//! This module defines all error types used throughout the adapter.
//!
//! ## Error Hierarchy
//!
//! The main [`Error`] enum covers every failure a caller can observe:
//!
//! | Variant | Cause | Surfaced? |
//! |---------|-------|-----------|
//! | [`Error::Role`] | Service-only operation on a client or vice versa | Always, never retried |
//! | [`Error::Config`] | Malformed or missing configuration template | Always, fatal |
//! | [`Error::Middleware`] | Underlying capability call failed | Always, except from `stop` |
//! | [`Error::InvalidState`] | Lifecycle precondition violated | Always |
//! | [`Error::Io`] | Persisting the configuration document failed | Always |
//! | [`Error::Json`] | Document could not be (de)serialized | Always |
//!
//! [`LockArtifactError`] is deliberately absent from [`Error`]: stale lock
//! removal is reported as a boolean by
//! [`Adapter::force_clear_locks`](crate::Adapter::force_clear_locks) and the
//! individual failures are only logged.
//!
//! ## Teardown
//!
//! [`Session::stop`](crate::Session::stop) and the implicit stop run when a
//! [`Session`](crate::Session) is dropped never return an error. Middleware
//! failures during teardown are logged at `warn` and absorbed.
//!
//! ## Usage Pattern
//!
//! ```no_run
//! use someip_adapter::prelude::*;
//!
//! fn register(client: &Session) -> Result<()> {
//!     match client.register() {
//!         Ok(()) => Ok(()),
//!         Err(Error::Role(e)) => {
//!             // This session already offered something
//!             eprintln!("wrong role: {e}");
//!             Err(Error::Role(e))
//!         }
//!         Err(e) => Err(e),
//!     }
//! }
//! # fn main() {}
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::session::{Role, Stage};

/// Result type alias using the adapter's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for all adapter operations.
#[derive(Debug)]
pub enum Error {
    /// Operation invoked against the wrong role.
    ///
    /// No middleware call was made.
    Role(RoleError),

    /// Configuration template or document is malformed or missing.
    Config(ConfigError),

    /// The middleware engine rejected a call.
    Middleware(MiddlewareError),

    /// The session is not in a stage that allows the operation.
    ///
    /// Examples: `create` twice, `start` before `create`, anything after `stop`.
    InvalidState {
        operation: &'static str,
        stage: Stage,
    },

    /// Writing or reading a file failed.
    Io(io::Error),

    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role(e) => write!(f, "Role error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {}", e.message),
            Self::Middleware(e) => write!(f, "Middleware error: {e}"),
            Self::InvalidState { operation, stage } => {
                write!(f, "`{operation}` is not allowed while {stage:?}")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<RoleError> for Error {
    fn from(e: RoleError) -> Self {
        Self::Role(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<MiddlewareError> for Error {
    fn from(e: MiddlewareError) -> Self {
        Self::Middleware(e)
    }
}

/// A service-only operation was called on a client, or the other way round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleError {
    /// The rejected operation (`"register"`, `"offer"`, ...).
    pub operation: &'static str,
    /// The role the session had when the operation was attempted.
    pub role: Role,
}

impl RoleError {
    pub(crate) fn new(operation: &'static str, role: Role) -> Self {
        Self { operation, role }
    }
}

impl fmt::Display for RoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::Service => write!(
                f,
                "`{}` is a client operation (client registers/requests, service offers/responds)",
                self.operation
            ),
            Role::Client | Role::Undetermined => write!(
                f,
                "`{}` is a service operation (client consumes events, service notifies)",
                self.operation
            ),
        }
    }
}

/// Configuration error
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by a [`Middleware`](crate::middleware::Middleware) implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareError {
    /// The capability that failed (`"create"`, `"send_service"`, ...).
    pub call: &'static str,
    pub message: String,
}

impl MiddlewareError {
    pub fn new(call: &'static str, message: impl Into<String>) -> Self {
        Self {
            call,
            message: message.into(),
        }
    }
}

impl fmt::Display for MiddlewareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.call, self.message)
    }
}

/// A stale lock artifact could not be removed.
///
/// Only ever logged; see [`LockSweeper`](crate::supervisor::LockSweeper).
#[derive(Debug)]
pub struct LockArtifactError {
    pub path: PathBuf,
    pub attempts: u32,
    pub source: io::Error,
}

impl fmt::Display for LockArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not remove {} after {} attempts: {}",
            self.path.display(),
            self.attempts,
            self.source
        )
    }
}

impl std::error::Error for LockArtifactError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_error_message_names_operation() {
        let err = Error::from(RoleError::new("register", Role::Service));
        let text = err.to_string();
        assert!(text.contains("register"));
        assert!(text.contains("client registers"));

        let err = Error::from(RoleError::new("notify", Role::Client));
        assert!(err.to_string().contains("service notifies"));
    }

    #[test]
    fn io_error_is_the_source() {
        use std::error::Error as _;

        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.source().is_some());
        assert!(Error::Config(ConfigError::new("bad")).source().is_none());
    }
}
