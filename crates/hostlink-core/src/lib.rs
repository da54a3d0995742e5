//! hostlink Core - Shared types for the host command bridge
//!
//! This crate provides the types shared between the wire protocol
//! (hostlink-protocol), the daemon (hostlinkd) and command handlers.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod handler;
pub mod pagination;
pub mod payload;
pub mod security;

// Re-exports for convenience
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use handler::{CommandHandler, SharedHandler};
pub use pagination::{Page, PageRequest, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use payload::Payload;
pub use security::{
    is_path_within_project, mask_secret, redact_secrets, tokens_equal,
    validate_and_normalize_path,
};
