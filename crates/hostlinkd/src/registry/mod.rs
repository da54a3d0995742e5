//! Command registry.
//!
//! Maps command names to handlers. The registry is built wholesale while a
//! bridge runtime initializes and is only read afterwards, so a plain
//! read/write lock is enough.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  initialize_registry  ┌─────────────────┐
//! │  Registrations   │──────────────────────▶│ CommandRegistry │
//! │ (builtin+extra)  │                       │  name → handler │
//! └──────────────────┘                       └────────┬────────┘
//!                                                     │ resolve()
//!                                                     ▼
//!                                            ┌─────────────────┐
//!                                            │   Dispatcher    │
//!                                            └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - A poisoned lock is recovered rather than propagated

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use hostlink_core::{BridgeError, BridgeResult, SharedHandler};

mod registration;

pub use registration::{initialize_registry, Registration, RegistryError};

/// Process-wide mapping from command name to handler.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, SharedHandler>>,
}

/// One row of [`RegistryStatistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub name: String,
    pub category: String,
    pub version: String,
    pub operations: Vec<String>,
}

/// Snapshot of the registry for logging and status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
    pub count: usize,
    pub entries: Vec<RegistryEntry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SharedHandler>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SharedHandler>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handler` under `name`, returning the handler it replaced.
    pub fn register(&self, name: impl Into<String>, handler: SharedHandler) -> Option<SharedHandler> {
        let name = name.into();
        debug!(command = %name, category = handler.category(), "Registering command handler");
        self.write().insert(name, handler)
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Looks up the handler for `name`.
    ///
    /// # Errors
    ///
    /// - `BridgeError::NotFound` if no handler is registered under `name`
    pub fn resolve(&self, name: &str) -> BridgeResult<SharedHandler> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound {
                command: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Returns the handler count and a name-sorted description of each entry.
    pub fn statistics(&self) -> RegistryStatistics {
        let handlers = self.read();
        let mut entries: Vec<RegistryEntry> = handlers
            .iter()
            .map(|(name, handler)| RegistryEntry {
                name: name.clone(),
                category: handler.category().to_string(),
                version: handler.version().to_string(),
                operations: handler
                    .supported_operations()
                    .iter()
                    .map(|op| op.to_string())
                    .collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        RegistryStatistics {
            count: entries.len(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_core::{CommandHandler, ErrorKind, Payload};
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Fixed(&'static str);

    impl CommandHandler for Fixed {
        fn category(&self) -> &str {
            "test"
        }
        fn version(&self) -> &str {
            self.0
        }
        fn supported_operations(&self) -> &[&str] {
            &["get"]
        }
        fn requires_compilation_wait(&self, _operation: &str) -> bool {
            false
        }
        fn execute(&self, _operation: &str, _payload: &Payload) -> BridgeResult<Value> {
            Ok(json!({ "version": self.0 }))
        }
    }

    #[test]
    fn test_resolve_is_stable_until_clear() {
        let registry = CommandRegistry::new();
        registry.register("items", Arc::new(Fixed("1.0.0")));

        let first = registry.resolve("items").unwrap();
        let second = registry.resolve("items").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.clear();
        let err = registry.resolve("items").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_register_overwrites() {
        let registry = CommandRegistry::new();
        assert!(registry.register("items", Arc::new(Fixed("1.0.0"))).is_none());
        assert!(registry.register("items", Arc::new(Fixed("2.0.0"))).is_some());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("items").unwrap().version(), "2.0.0");
    }

    #[test]
    fn test_statistics() {
        let registry = CommandRegistry::new();
        registry.register("zeta", Arc::new(Fixed("1.0.0")));
        registry.register("alpha", Arc::new(Fixed("1.1.0")));

        let stats = registry.statistics();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.entries[0].name, "alpha");
        assert_eq!(stats.entries[0].version, "1.1.0");
        assert_eq!(stats.entries[1].operations, vec!["get".to_string()]);

        registry.clear();
        assert_eq!(registry.statistics().count, 0);
        assert!(registry.is_empty());
    }
}
