//! WebSocket server for the bridge.
//!
//! The server:
//! - Listens on a TCP socket for client connections
//! - Runs the bounded upgrade handshake for each connection
//! - Spawns a ConnectionHandler per upgraded session
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  BridgeServer   │
//! │                 │
//! │  TcpListener    │
//! └───────┬─────────┘
//!         │ accept() + handshake
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│   Dispatcher    │
//! │  (per session)  │     │                 │
//! └─────────────────┘     └────────┬────────┘
//!                                  │ write operations
//!                                  ▼
//!                         ┌─────────────────┐
//!                         │   Compilation   │
//!                         │   Coordinator   │
//!                         └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept and handshake errors are logged and allow continued operation

mod connection;
pub mod handshake;
pub mod heartbeat;
pub mod send;

pub use connection::{
    ConnectionError, ConnectionHandler, SessionHandle, SessionSettings, SessionsMap,
};

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hostlink_core::BridgeConfig;

use crate::compilation::CompilationCoordinator;
use crate::dispatch::Dispatcher;
use crate::registry::RegistryError;

use self::handshake::HandshakeError;

/// Opaque identifier of one client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds a fresh id from the accept counter and the current time.
    pub fn generate(connection_number: u64) -> Self {
        Self(format!(
            "session-{}-{:x}",
            connection_number,
            Utc::now().timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// WebSocket server for the bridge.
pub struct BridgeServer {
    listener: TcpListener,
    settings: Arc<SessionSettings>,
    dispatcher: Arc<Dispatcher>,
    coordinator: CompilationCoordinator,
    sessions: SessionsMap,
    cancel_token: CancellationToken,

    /// One permit per live or handshaking session
    session_slots: Arc<Semaphore>,
    max_sessions: usize,

    /// Connection counter for generating session IDs
    connection_counter: AtomicU64,
}

impl BridgeServer {
    /// Binds the listening socket named by `config.network`.
    ///
    /// Port 0 asks the OS for a free port; see [`BridgeServer::local_addr`].
    pub async fn bind(
        config: &BridgeConfig,
        dispatcher: Arc<Dispatcher>,
        coordinator: CompilationCoordinator,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let address = config.network.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| ServerError::Bind {
                address: address.clone(),
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            settings: Arc::new(SessionSettings::from_config(config)),
            dispatcher,
            coordinator,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            cancel_token,
            session_slots: Arc::new(Semaphore::new(config.network.max_sessions)),
            max_sessions: config.network.max_sessions,
            connection_counter: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::LocalAddr(e.to_string()))
    }

    /// Shared view of the live sessions.
    pub fn sessions(&self) -> SessionsMap {
        Arc::clone(&self.sessions)
    }

    /// Accepts connections until the cancellation token is triggered.
    pub async fn run(self) -> Result<(), ServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(address = %addr, path = %self.settings.handshake.path, "Bridge server listening");
        }

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, peer, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Handshakes a new connection and spawns its session handler.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, connection_number: u64) {
        let _ = stream.set_nodelay(true);

        let settings = Arc::clone(&self.settings);
        let dispatcher = Arc::clone(&self.dispatcher);
        let coordinator = self.coordinator.clone();
        let sessions = Arc::clone(&self.sessions);
        let token = self.cancel_token.child_token();
        let slot = Arc::clone(&self.session_slots).try_acquire_owned();
        let max_sessions = self.max_sessions;

        tokio::spawn(async move {
            let Ok(_slot) = slot else {
                let reason = handshake::reject(
                    stream,
                    &settings.handshake,
                    HandshakeError::TooManySessions { max: max_sessions },
                )
                .await;
                warn!(peer = %peer, error = %reason, "Handshake rejected");
                return;
            };

            let (ws, request) = match handshake::accept(stream, &settings.handshake).await {
                Ok(upgraded) => upgraded,
                Err(HandshakeError::Closed) => {
                    debug!(peer = %peer, "Peer left during handshake");
                    return;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Handshake rejected");
                    return;
                }
            };

            let session_id = SessionId::generate(connection_number);
            debug!(
                peer = %peer,
                session_id = %session_id,
                protocol = ?request.protocol_version,
                "Upgrade accepted"
            );

            let handler = ConnectionHandler::new(
                ws,
                session_id.clone(),
                settings,
                dispatcher,
                coordinator,
                sessions,
                token,
            );
            if let Err(e) = handler.run().await {
                debug!(session_id = %session_id, error = %e, "Session ended with error");
            }
        });
    }

    /// Cancels every live session and waits for them to deregister.
    async fn cleanup(&self) {
        let count = {
            let sessions = self.sessions.read().await;
            for handle in sessions.values() {
                handle.token.cancel();
            }
            sessions.len()
        };

        if count > 0 {
            debug!(sessions = count, "Waiting for sessions to close");
        }
        for _ in 0..50 {
            if self.sessions.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        info!("Server cleanup complete");
    }
}

/// Errors from the bridge server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {address}: {error}")]
    Bind { address: String, error: String },

    #[error("Failed to read local address: {0}")]
    LocalAddr(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}
