//! Handler capability contract implemented by command collaborators.

use std::sync::Arc;

use serde_json::Value;

use crate::error::BridgeResult;
use crate::payload::Payload;

/// A unit implementing a closed set of named operations under one command name.
///
/// Handlers run on the blocking pool and must only perform bounded local work
/// (file I/O); they never make network calls. Failures are returned as
/// [`crate::BridgeError`] values and converted to error envelopes by the dispatcher.
///
/// # Example
///
/// ```
/// use hostlink_core::{BridgeResult, CommandHandler, Payload};
/// use serde_json::{json, Value};
///
/// struct Echo;
///
/// impl CommandHandler for Echo {
///     fn category(&self) -> &str { "utility" }
///     fn version(&self) -> &str { "1.0.0" }
///     fn supported_operations(&self) -> &[&str] { &["echo"] }
///     fn requires_compilation_wait(&self, _operation: &str) -> bool { false }
///     fn execute(&self, _operation: &str, payload: &Payload) -> BridgeResult<Value> {
///         Ok(json!({ "echo": payload.clone().into_value() }))
///     }
/// }
///
/// assert!(Echo.supports("echo"));
/// assert!(!Echo.supports("shout"));
/// ```
pub trait CommandHandler: Send + Sync {
    /// Grouping label reported in registry statistics.
    fn category(&self) -> &str;

    /// Handler version reported in registry statistics.
    fn version(&self) -> &str;

    /// The complete set of operations this handler accepts.
    fn supported_operations(&self) -> &[&str];

    /// Whether executing `operation` may make the host rebuild its state.
    fn requires_compilation_wait(&self, operation: &str) -> bool;

    /// Runs `operation` against `payload`.
    fn execute(&self, operation: &str, payload: &Payload) -> BridgeResult<Value>;

    /// Returns true if `operation` is in the supported set.
    fn supports(&self, operation: &str) -> bool {
        self.supported_operations().iter().any(|op| *op == operation)
    }
}

/// Shared handle to a registered handler.
pub type SharedHandler = Arc<dyn CommandHandler>;
