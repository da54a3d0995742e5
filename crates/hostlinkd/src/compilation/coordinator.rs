//! Compilation-await coordinator.
//!
//! Write-classified operations may make the host rebuild, which tears down
//! every task and session of the running bridge. The coordinator checkpoints
//! the request in the durable store before the operation runs, so the
//! response can be resumed by the next bridge runtime and delivered to the
//! next client session that completes its handshake.
//!
//! At most one record is outstanding at a time. Writes queue on a fair
//! async mutex; the guard is held until the response is delivered, parked
//! delivery expires, or the write fails.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{oneshot, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hostlink_core::{BridgeConfig, BridgeError, Payload, SharedHandler};
use hostlink_protocol::ResponseEnvelope;

use super::store::{CompilationRecord, DurableStore, PendingResult};
use crate::dispatch::execute_guarded;
use crate::host::{HostPhase, HostSignals};
use crate::server::SessionId;

/// Result carried when a resumed write has no recorded result.
const COMPLETED_MESSAGE: &str = "Compilation completed";

/// Timing for the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Upper bound on how long a record stays outstanding.
    pub max_wait: Duration,

    /// Limit on a single handler execution.
    pub command_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_wait: config.compilation.max_wait(),
            command_timeout: config.timing.command_timeout(),
        }
    }
}

/// A write-classified operation handed to the coordinator.
pub struct WriteJob {
    pub request_id: Option<String>,
    pub session_id: SessionId,
    pub command: String,
    pub operation: String,
    pub handler: SharedHandler,
    pub payload: Payload,
}

/// A response waiting for the next session to complete its handshake.
pub struct PendingDelivery {
    response: ResponseEnvelope,
    deadline: Instant,
    _gate: Option<OwnedMutexGuard<()>>,
}

impl PendingDelivery {
    pub fn response(&self) -> &ResponseEnvelope {
        &self.response
    }

    pub fn request_id(&self) -> Option<&str> {
        self.response.request_id.as_deref()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// What [`CompilationCoordinator::resume`] found in the durable store.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// No record was outstanding.
    Nothing,

    /// A record existed but no client was connected when it was written.
    Discarded,

    /// A response was parked for the next session.
    Parked {
        request_id: Option<String>,
        success: bool,
    },
}

struct Inner {
    store: Arc<dyn DurableStore>,
    host: HostSignals,
    settings: CoordinatorSettings,
    gate: Arc<tokio::sync::Mutex<()>>,
    pending: Mutex<Option<PendingDelivery>>,
    cancel: CancellationToken,
}

/// Coordinates write-classified operations with host rebuilds.
///
/// One coordinator lives per bridge runtime. Its background tasks stop when
/// the runtime's cancellation token fires; the durable record does not.
#[derive(Clone)]
pub struct CompilationCoordinator {
    inner: Arc<Inner>,
}

impl CompilationCoordinator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        host: HostSignals,
        settings: CoordinatorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                host,
                settings,
                gate: Arc::new(tokio::sync::Mutex::new(())),
                pending: Mutex::new(None),
                cancel,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.inner.store
    }

    /// Runs a write-classified operation and waits for its response.
    ///
    /// The work runs on a task detached from the caller. If the caller goes
    /// away (its session died), the response is parked instead of lost.
    pub async fn execute(&self, job: WriteJob) -> ResponseEnvelope {
        let request_id = job.request_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Write abandoned by runtime teardown, durable record kept");
                }
                _ = run_write(inner, job, reply_tx) => {}
            }
        });

        match reply_rx.await {
            Ok(response) => response,
            Err(_) => ResponseEnvelope::failure(
                request_id,
                &BridgeError::connection_lost("bridge is rebuilding"),
            ),
        }
    }

    /// Resolves a record left behind by a previous runtime.
    ///
    /// Called once while the runtime initializes, before any session exists.
    pub async fn resume(&self) -> Result<ResumeOutcome, BridgeError> {
        let store = self.inner.store.as_ref();
        let record = CompilationRecord::load(store)
            .map_err(|e| BridgeError::handler(format!("failed to read compilation record: {e}")))?;

        let Some(record) = record else {
            return Ok(ResumeOutcome::Nothing);
        };

        if !record.was_connected_before_compile {
            info!("Discarding compilation record written without a connected client");
            clear_record(store);
            return Ok(ResumeOutcome::Discarded);
        }

        let request_id = record.request_id().map(str::to_string);
        let elapsed = record.elapsed(Utc::now());
        let max_wait = self.inner.settings.max_wait;

        let response = if elapsed > max_wait {
            warn!(request_id = ?request_id, "Compilation await exceeded its maximum wait");
            ResponseEnvelope::failure(
                request_id.clone(),
                &BridgeError::Timeout {
                    operation: "compilation await".to_string(),
                    elapsed_ms: millis(max_wait),
                },
            )
        } else if let Some(message) = self.inner.host.last_failure() {
            ResponseEnvelope::failure(
                request_id.clone(),
                &BridgeError::CompilationFailed { message },
            )
        } else {
            let result = record
                .pending_result
                .as_ref()
                .and_then(|p| p.result.clone())
                .unwrap_or_else(|| json!({ "message": COMPLETED_MESSAGE }));
            ResponseEnvelope::success(request_id.clone(), result)
        };

        let success = response.success;
        let gate = Arc::clone(&self.inner.gate).lock_owned().await;
        park(
            &self.inner,
            PendingDelivery {
                response,
                deadline: Instant::now() + max_wait,
                _gate: Some(gate),
            },
        );

        info!(request_id = ?request_id, success, "Resumed compilation await, awaiting next session");
        Ok(ResumeOutcome::Parked {
            request_id,
            success,
        })
    }

    /// Takes the parked response, if any, for delivery to a new session.
    ///
    /// An expired response is dropped and the durable record cleared.
    pub fn take_pending(&self) -> Option<PendingDelivery> {
        let pending = lock_pending(&self.inner).take()?;
        if pending.is_expired(Instant::now()) {
            warn!(request_id = ?pending.request_id(), "Dropping expired compilation response");
            clear_record(self.inner.store.as_ref());
            return None;
        }
        Some(pending)
    }

    /// Marks a parked response as delivered and releases the write queue.
    pub fn delivered(&self, pending: PendingDelivery) {
        info!(request_id = ?pending.request_id(), "Delivered deferred compilation response");
        clear_record(self.inner.store.as_ref());
        drop(pending);
    }

    /// Puts back a parked response whose delivery failed.
    pub fn repark(&self, pending: PendingDelivery) {
        let mut slot = lock_pending(&self.inner);
        if slot.is_none() {
            *slot = Some(pending);
        }
    }

    pub fn has_pending(&self) -> bool {
        lock_pending(&self.inner).is_some()
    }
}

async fn run_write(
    inner: Arc<Inner>,
    job: WriteJob,
    reply: oneshot::Sender<ResponseEnvelope>,
) {
    let gate = Arc::clone(&inner.gate).lock_owned().await;
    let started = Instant::now();
    let store = inner.store.as_ref();

    let WriteJob {
        request_id,
        session_id,
        command,
        operation,
        handler,
        payload,
    } = job;

    let record = CompilationRecord::begin(
        PendingResult {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            command: command.clone(),
            operation: operation.clone(),
            result: None,
        },
        Utc::now(),
    );
    if let Err(e) = record.save(store) {
        error!(error = %e, "Failed to persist compilation record");
        let err = BridgeError::handler(format!("failed to persist compilation record: {e}"));
        let _ = reply.send(ResponseEnvelope::failure(request_id, &err));
        return;
    }

    debug!(request_id = ?request_id, command = %command, operation = %operation, "Running write-classified operation");

    let value = match execute_guarded(
        handler,
        operation.clone(),
        payload,
        inner.settings.command_timeout,
    )
    .await
    {
        Ok(value) => value,
        Err(e) => {
            clear_record(store);
            let _ = reply.send(ResponseEnvelope::failure(request_id, &e));
            return;
        }
    };

    let outcome = if inner.host.is_rebuilding() {
        let mut updated = record;
        if let Some(pending) = updated.pending_result.as_mut() {
            pending.result = Some(value.clone());
        }
        if let Err(e) = updated.save(store) {
            warn!(error = %e, "Failed to persist write result before rebuild");
        }
        info!(request_id = ?request_id, "Awaiting host rebuild");
        await_rebuild(&inner.host, started + inner.settings.max_wait, inner.settings.max_wait).await
    } else {
        Ok(())
    };

    let response = match outcome {
        Ok(()) => ResponseEnvelope::success(request_id, value),
        Err(e) => ResponseEnvelope::failure(request_id, &e),
    };

    match reply.send(response) {
        Ok(()) => {
            clear_record(store);
            drop(gate);
        }
        Err(response) => {
            warn!(request_id = ?response.request_id, "Session gone before write resolved, parking response");
            park(
                &inner,
                PendingDelivery {
                    response,
                    deadline: started + inner.settings.max_wait,
                    _gate: Some(gate),
                },
            );
        }
    }
}

/// Waits for the host to leave `Rebuilding`.
async fn await_rebuild(
    host: &HostSignals,
    deadline: Instant,
    max_wait: Duration,
) -> Result<(), BridgeError> {
    let mut rx = host.subscribe();
    loop {
        let phase = rx.borrow_and_update().clone();
        match phase {
            HostPhase::Rebuilt {
                failure: Some(message),
            } => return Err(BridgeError::CompilationFailed { message }),
            HostPhase::Rebuilt { failure: None } | HostPhase::Running => return Ok(()),
            HostPhase::Rebuilding { .. } => {}
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err(BridgeError::connection_lost("host signal channel closed"));
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(BridgeError::Timeout {
                    operation: "compilation await".to_string(),
                    elapsed_ms: millis(max_wait),
                });
            }
        }
    }
}

/// Parks `pending` and arms its expiry timer.
fn park(inner: &Arc<Inner>, pending: PendingDelivery) {
    let deadline = pending.deadline;
    {
        let mut slot = lock_pending(inner);
        if let Some(previous) = slot.replace(pending) {
            warn!(request_id = ?previous.request_id(), "Replacing undelivered compilation response");
        }
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::select! {
            _ = inner.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => expire_pending(&inner),
        }
    });
}

fn expire_pending(inner: &Inner) {
    let mut slot = lock_pending(inner);
    let expired = slot
        .as_ref()
        .is_some_and(|pending| pending.is_expired(Instant::now()));
    if expired {
        if let Some(pending) = slot.take() {
            warn!(
                request_id = ?pending.request_id(),
                "No session connected before the delivery window closed, dropping compilation response"
            );
            clear_record(inner.store.as_ref());
        }
    }
}

fn lock_pending(inner: &Inner) -> MutexGuard<'_, Option<PendingDelivery>> {
    inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn clear_record(store: &dyn DurableStore) {
    if let Err(e) = CompilationRecord::clear(store) {
        error!(error = %e, "Failed to clear compilation record");
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
