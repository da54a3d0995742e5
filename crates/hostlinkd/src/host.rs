//! Host rebuild signalling.
//!
//! The host application periodically throws away its in-process state and
//! rebuilds it. [`HostSignals`] is the shared channel through which handlers
//! request a rebuild, the supervisor reports its outcome, and the compilation
//! coordinator waits for it.
//!
//! ```text
//!  Running ──request_rebuild──▶ Rebuilding ──finish_rebuild──▶ Rebuilt{failure?}
//!                                   ▲                               │
//!                                   └─────────request_rebuild───────┘
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle phase of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPhase {
    /// No rebuild has happened since startup.
    Running,

    /// A rebuild was requested and has not finished yet.
    Rebuilding { reason: String },

    /// The most recent rebuild finished, successfully or not.
    Rebuilt { failure: Option<String> },
}

impl HostPhase {
    pub fn is_rebuilding(&self) -> bool {
        matches!(self, Self::Rebuilding { .. })
    }

    /// Short lowercase label used in status payloads.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Rebuilding { .. } => "rebuilding",
            Self::Rebuilt { failure: None } => "rebuilt",
            Self::Rebuilt { failure: Some(_) } => "rebuild_failed",
        }
    }
}

impl fmt::Display for HostPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rebuilding { reason } => write!(f, "rebuilding ({reason})"),
            Self::Rebuilt {
                failure: Some(failure),
            } => write!(f, "rebuild failed: {failure}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Cloneable handle to the host's rebuild channel.
#[derive(Clone)]
pub struct HostSignals {
    tx: Arc<watch::Sender<HostPhase>>,
}

impl HostSignals {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HostPhase::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Returns a snapshot of the current phase.
    pub fn phase(&self) -> HostPhase {
        self.tx.borrow().clone()
    }

    pub fn is_rebuilding(&self) -> bool {
        self.tx.borrow().is_rebuilding()
    }

    /// Moves the host to `Rebuilding`.
    ///
    /// Returns false if a rebuild is already in progress; the earlier reason is kept.
    pub fn request_rebuild(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.tx.send_if_modified(|phase| {
            if phase.is_rebuilding() {
                false
            } else {
                *phase = HostPhase::Rebuilding {
                    reason: reason.clone(),
                };
                true
            }
        });

        if changed {
            info!(reason = %reason, "Host rebuild requested");
        }
        changed
    }

    /// Records the outcome of the rebuild in progress.
    pub fn finish_rebuild(&self, outcome: Result<(), String>) {
        let failure = outcome.err();
        match &failure {
            None => info!("Host rebuild finished"),
            Some(message) => warn!(error = %message, "Host rebuild failed"),
        }
        self.tx.send_replace(HostPhase::Rebuilt { failure });
    }

    /// Failure reported by the most recent rebuild, if it failed.
    pub fn last_failure(&self) -> Option<String> {
        match &*self.tx.borrow() {
            HostPhase::Rebuilt { failure } => failure.clone(),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<HostPhase> {
        self.tx.subscribe()
    }
}

impl Default for HostSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSignals")
            .field("phase", &*self.tx.borrow())
            .finish()
    }
}

/// Waits until `rx` reports a rebuild and returns its reason.
///
/// Returns `None` if every sender is gone.
pub async fn wait_for_rebuild(rx: &mut watch::Receiver<HostPhase>) -> Option<String> {
    loop {
        if let HostPhase::Rebuilding { reason } = &*rx.borrow_and_update() {
            return Some(reason.clone());
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}
