//! One bridge runtime: registry, coordinator, dispatcher and server.
//!
//! A runtime lives from host startup (or the end of a rebuild) until the
//! next rebuild begins. Nothing in it survives [`BridgeRuntime::shutdown`]
//! except what the coordinator wrote to the durable store.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hostlink_core::{mask_secret, BridgeConfig};

use crate::compilation::{CompilationCoordinator, CoordinatorSettings, DurableStore};
use crate::dispatch::{Dispatcher, RefreshHook};
use crate::handlers::{builtin_registrations, HandlerContext};
use crate::host::HostSignals;
use crate::registry::{initialize_registry, CommandRegistry, Registration};
use crate::server::{BridgeServer, ServerError, SessionsMap};

/// What survives across runtimes, supplied by the host.
#[derive(Clone)]
pub struct BridgeDeps {
    pub host: HostSignals,
    pub store: Arc<dyn DurableStore>,
    pub refresh_hook: Option<RefreshHook>,

    /// Host handlers registered next to the built-in ones.
    pub extra: Vec<Registration>,
}

impl BridgeDeps {
    pub fn new(host: HostSignals, store: Arc<dyn DurableStore>) -> Self {
        Self {
            host,
            store,
            refresh_hook: None,
            extra: Vec::new(),
        }
    }

    pub fn with_refresh_hook(mut self, hook: RefreshHook) -> Self {
        self.refresh_hook = Some(hook);
        self
    }

    pub fn with_handler(mut self, registration: Registration) -> Self {
        self.extra.push(registration);
        self
    }
}

/// A running bridge.
pub struct BridgeRuntime {
    cancel: CancellationToken,
    registry: Arc<CommandRegistry>,
    coordinator: CompilationCoordinator,
    sessions: SessionsMap,
    local_addr: SocketAddr,
    server: JoinHandle<Result<(), ServerError>>,
}

impl BridgeRuntime {
    /// Initializes the registry, resumes any outstanding compilation await,
    /// and starts accepting connections.
    pub async fn start(config: &BridgeConfig, deps: &BridgeDeps) -> Result<Self, ServerError> {
        let cancel = CancellationToken::new();

        let registry = Arc::new(CommandRegistry::new());
        let ctx = HandlerContext::new(config, deps.host.clone(), Arc::clone(&deps.store), &registry);
        let mut registrations = builtin_registrations(&ctx);
        registrations.extend(deps.extra.iter().cloned());
        let stats = initialize_registry(&registry, registrations)?;

        let coordinator = CompilationCoordinator::new(
            Arc::clone(&deps.store),
            deps.host.clone(),
            CoordinatorSettings::from_config(config),
            cancel.clone(),
        );
        if let Err(e) = coordinator.resume().await {
            warn!(error = %e, "Could not resume compilation await");
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            coordinator.clone(),
            config.timing.command_timeout(),
        )
        .with_refresh_hook(deps.refresh_hook.clone())
        .with_secrets(config.security.token.clone());

        let server = BridgeServer::bind(
            config,
            Arc::new(dispatcher),
            coordinator.clone(),
            cancel.clone(),
        )
        .await?;
        let local_addr = server.local_addr()?;
        let sessions = server.sessions();

        info!(
            address = %local_addr,
            handlers = stats.count,
            token = %mask_secret(config.security.token.as_deref()),
            "Bridge runtime started"
        );

        Ok(Self {
            cancel,
            registry,
            coordinator,
            sessions,
            local_addr,
            server: tokio::spawn(server.run()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &CompilationCoordinator {
        &self.coordinator
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Tears the runtime down: every session, task and handler goes away.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        match self.server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Server stopped with error"),
            Err(e) => warn!(error = %e, "Server task failed"),
        }
        self.registry.clear();
        info!("Bridge runtime stopped");
    }
}
