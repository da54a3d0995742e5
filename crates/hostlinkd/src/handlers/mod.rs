//! Handlers registered by the bridge itself.
//!
//! - `ping` - liveness and registry size
//! - `compilationAwait` - host rebuild status and polling
//! - `documents` - file-backed JSON documents under the project root

mod compilation_await;
mod documents;
mod ping;

pub use compilation_await::CompilationAwaitHandler;
pub use documents::DocumentsHandler;
pub use ping::PingHandler;

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use hostlink_core::config::HostConfig;
use hostlink_core::BridgeConfig;

use crate::compilation::DurableStore;
use crate::host::HostSignals;
use crate::registry::{CommandRegistry, Registration};

/// Command name of [`PingHandler`]
pub const PING_COMMAND: &str = "ping";

/// Command name of [`CompilationAwaitHandler`]
pub const COMPILATION_AWAIT_COMMAND: &str = "compilationAwait";

/// Command name of [`DocumentsHandler`]
pub const DOCUMENTS_COMMAND: &str = "documents";

/// Everything the built-in handlers may reach.
#[derive(Clone)]
pub struct HandlerContext {
    pub project_root: PathBuf,
    pub host_config: HostConfig,
    pub host: HostSignals,
    pub store: Arc<dyn DurableStore>,
    pub registry: Weak<CommandRegistry>,
    pub command_timeout: Duration,
}

impl HandlerContext {
    pub fn new(
        config: &BridgeConfig,
        host: HostSignals,
        store: Arc<dyn DurableStore>,
        registry: &Arc<CommandRegistry>,
    ) -> Self {
        Self {
            project_root: config.security.project_root.clone(),
            host_config: config.host.clone(),
            host,
            store,
            registry: Arc::downgrade(registry),
            command_timeout: config.timing.command_timeout(),
        }
    }
}

/// Registrations for every built-in handler.
pub fn builtin_registrations(ctx: &HandlerContext) -> Vec<Registration> {
    vec![
        Registration::new(PING_COMMAND, Arc::new(PingHandler::new(ctx.registry.clone()))),
        Registration::new(
            COMPILATION_AWAIT_COMMAND,
            Arc::new(CompilationAwaitHandler::new(
                ctx.host.clone(),
                Arc::clone(&ctx.store),
                ctx.command_timeout,
            )),
        ),
        Registration::new(
            DOCUMENTS_COMMAND,
            Arc::new(DocumentsHandler::new(
                &ctx.project_root,
                ctx.host_config.clone(),
                ctx.host.clone(),
            )),
        ),
    ]
}
