//! Registry initialization.

use std::collections::HashSet;

use tracing::{debug, info};

use hostlink_core::SharedHandler;

use super::{CommandRegistry, RegistryStatistics};

/// A handler paired with the command name it serves.
#[derive(Clone)]
pub struct Registration {
    pub name: String,
    pub handler: SharedHandler,
}

impl Registration {
    pub fn new(name: impl Into<String>, handler: SharedHandler) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

/// Errors that can occur while building the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Command '{name}' is registered more than once")]
    DuplicateCommand { name: String },

    #[error("Command name must not be empty")]
    EmptyName,
}

/// Clears `registry` and fills it with `registrations`.
///
/// The set is checked before anything is inserted: on error the registry is
/// left empty rather than half-built.
pub fn initialize_registry(
    registry: &CommandRegistry,
    registrations: Vec<Registration>,
) -> Result<RegistryStatistics, RegistryError> {
    registry.clear();

    let mut seen = HashSet::new();
    for registration in &registrations {
        if registration.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if !seen.insert(registration.name.as_str()) {
            return Err(RegistryError::DuplicateCommand {
                name: registration.name.clone(),
            });
        }
    }

    for Registration { name, handler } in registrations {
        registry.register(name, handler);
    }

    let stats = registry.statistics();
    info!(count = stats.count, "Command handlers registered");
    for entry in &stats.entries {
        debug!(
            command = %entry.name,
            category = %entry.category,
            version = %entry.version,
            "Registered handler"
        );
    }
    Ok(stats)
}
