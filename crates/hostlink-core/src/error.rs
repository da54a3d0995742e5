//! Bridge error taxonomy following panic-free policy.
//!
//! Every failure that can reach a client is a [`BridgeError`]. Each variant maps to a
//! stable [`ErrorKind`] string carried in error envelopes, so clients can branch on the
//! kind without parsing messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Message used when a handler fails without saying why.
const EMPTY_HANDLER_MESSAGE: &str = "Handler failed without an error message";

/// Stable classification of bridge errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    HandshakeTooLarge,
    MessageTooLarge,
    ConnectionLost,
    SendFailed,
    NotFound,
    UnknownOperation,
    ValidationError,
    PathTraversal,
    CompilationFailed,
    Timeout,
    HandlerError,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandshakeTooLarge => "HandshakeTooLarge",
            Self::MessageTooLarge => "MessageTooLarge",
            Self::ConnectionLost => "ConnectionLost",
            Self::SendFailed => "SendFailed",
            Self::NotFound => "NotFound",
            Self::UnknownOperation => "UnknownOperation",
            Self::ValidationError => "ValidationError",
            Self::PathTraversal => "PathTraversal",
            Self::CompilationFailed => "CompilationFailed",
            Self::Timeout => "Timeout",
            Self::HandlerError => "HandlerError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the bridge to callers and clients.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Upgrade request headers exceeded the handshake cap
    #[error("Handshake headers exceed {max} bytes")]
    HandshakeTooLarge { max: usize },

    /// A single message exceeded the message cap
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The session carrying the request went away
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The send pipeline gave up
    #[error("Send failed after {attempts} attempt(s): {reason}")]
    SendFailed { attempts: u32, reason: String },

    /// No handler is registered under the command name
    #[error("Command not found: {command}")]
    NotFound { command: String },

    /// The handler does not support the requested operation
    #[error("Unknown operation '{operation}' for command '{command}'")]
    UnknownOperation { command: String, operation: String },

    /// A request field is missing or malformed
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// A path argument resolves outside the project root
    #[error("Path traversal detected: '{path}' is outside the project root")]
    PathTraversal { path: String },

    /// The host reported a failed rebuild
    #[error("Compilation failed: {message}")]
    CompilationFailed { message: String },

    /// An operation exceeded its time bound
    #[error("{operation} timed out after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Unclassified handler failure, message preserved
    #[error("{message}")]
    Handler { message: String },
}

impl BridgeError {
    /// Returns the stable kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HandshakeTooLarge { .. } => ErrorKind::HandshakeTooLarge,
            Self::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::SendFailed { .. } => ErrorKind::SendFailed,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::PathTraversal { .. } => ErrorKind::PathTraversal,
            Self::CompilationFailed { .. } => ErrorKind::CompilationFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Handler { .. } => ErrorKind::HandlerError,
        }
    }

    /// A required field is absent.
    pub fn missing_field(field: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: "field is required".to_string(),
        }
    }

    /// A field is present but unusable.
    pub fn invalid_field(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Wraps an unclassified handler failure.
    ///
    /// Empty messages are replaced so error envelopes never carry a blank message.
    pub fn handler(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            EMPTY_HANDLER_MESSAGE.to_string()
        } else {
            message
        };
        Self::Handler { message }
    }

    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
