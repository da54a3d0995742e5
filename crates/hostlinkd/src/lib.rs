//! hostlink daemon - WebSocket command bridge for a rebuilding host
//!
//! This crate provides the bridge that lets automation clients drive a host
//! application whose in-process state is periodically rebuilt:
//! - `server` - WebSocket transport, handshake, heartbeat and send pipeline
//! - `registry` - command name to handler lookup
//! - `dispatch` - request routing, guarded handler execution
//! - `compilation` - durable compilation-await across host rebuilds
//! - `host` - rebuild phase signalling
//! - `bridge` - one runtime assembled from the above
//! - `supervisor` - the rebuild loop owning successive runtimes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HostSupervisor                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌───────────────── BridgeRuntime ─────────────────────┐    │
//! │  │                                                     │    │
//! │  │  BridgeServer ──▶ ConnectionHandler (per session)   │    │
//! │  │                        │                            │    │
//! │  │                        ▼                            │    │
//! │  │                   Dispatcher ──▶ CommandRegistry    │    │
//! │  │                        │                            │    │
//! │  │                        ▼ write operations           │    │
//! │  │              CompilationCoordinator                 │    │
//! │  └────────────────────────┬────────────────────────────┘    │
//! │                           │                                 │
//! │       HostSignals ◀───────┼───────▶ DurableStore            │
//! │   (rebuild phases)        │    (survives every runtime)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully
//! - Handler panics are caught and reported as error responses

pub mod bridge;
pub mod compilation;
pub mod dispatch;
pub mod handlers;
pub mod host;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use bridge::{BridgeDeps, BridgeRuntime};
pub use host::{HostPhase, HostSignals};
pub use supervisor::{ConfigLoader, HostSupervisor};
