use std::sync::Weak;

use chrono::Utc;
use serde_json::{json, Value};

use hostlink_core::{BridgeError, BridgeResult, CommandHandler, Payload};

use crate::registry::CommandRegistry;

/// Answers `ping` with a timestamp and the number of registered handlers.
pub struct PingHandler {
    registry: Weak<CommandRegistry>,
}

impl PingHandler {
    pub fn new(registry: Weak<CommandRegistry>) -> Self {
        Self { registry }
    }
}

impl CommandHandler for PingHandler {
    fn category(&self) -> &str {
        "utility"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn supported_operations(&self) -> &[&str] {
        &["ping"]
    }

    fn requires_compilation_wait(&self, _operation: &str) -> bool {
        false
    }

    fn execute(&self, operation: &str, _payload: &Payload) -> BridgeResult<Value> {
        if operation != "ping" {
            return Err(BridgeError::UnknownOperation {
                command: "ping".to_string(),
                operation: operation.to_string(),
            });
        }

        // The registry outlives its handlers except during teardown.
        let registered = self.registry.upgrade().map(|r| r.len()).unwrap_or(0);

        Ok(json!({
            "message": "pong",
            "timestamp": Utc::now().to_rfc3339(),
            "registeredHandlers": registered,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ping_reports_registry_size() {
        let registry = Arc::new(CommandRegistry::new());
        let handler = Arc::new(PingHandler::new(Arc::downgrade(&registry)));
        registry.register("ping", handler.clone());

        let result = handler.execute("ping", &Payload::new()).unwrap();
        assert_eq!(result["message"], "pong");
        assert_eq!(result["registeredHandlers"], 1);
        assert!(result["timestamp"].as_str().is_some());
    }

    #[test]
    fn test_ping_after_registry_dropped() {
        let handler = {
            let registry = Arc::new(CommandRegistry::new());
            PingHandler::new(Arc::downgrade(&registry))
        };
        let result = handler.execute("ping", &Payload::new()).unwrap();
        assert_eq!(result["registeredHandlers"], 0);
    }
}
