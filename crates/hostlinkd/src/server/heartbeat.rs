//! Per-session liveness probing.
//!
//! ```text
//!   Alive ──tick──▶ AwaitingPong ──ack──▶ Alive
//!                     │   ▲
//!                tick │   │ (re-probe while timeout not reached)
//!                     ▼   │
//!                   timeout elapsed ──▶ Dead (terminal)
//! ```
//!
//! Death is measured from the first unanswered probe, not the latest one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::send::Outgoing;
use super::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Alive,
    AwaitingPong { since: Instant },
    Dead,
}

/// What the driver must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendProbe(u64),
    DeclareDead,
}

/// Pure heartbeat state machine.
#[derive(Debug)]
pub struct Heartbeat {
    state: HeartbeatState,
    timeout: Duration,
    seq: u64,
}

impl Heartbeat {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: HeartbeatState::Alive,
            timeout,
            seq: 0,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.state == HeartbeatState::Dead
    }

    /// Advances the machine at an interval tick.
    ///
    /// Returns `DeclareDead` exactly once; a dead heartbeat stays idle.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        match self.state {
            HeartbeatState::Dead => HeartbeatAction::Idle,
            HeartbeatState::Alive => {
                self.state = HeartbeatState::AwaitingPong { since: now };
                self.next_probe()
            }
            HeartbeatState::AwaitingPong { since } => {
                if now.saturating_duration_since(since) >= self.timeout {
                    self.state = HeartbeatState::Dead;
                    HeartbeatAction::DeclareDead
                } else {
                    self.next_probe()
                }
            }
        }
    }

    /// Records an ack. Returns false if the session was already dead.
    pub fn on_ack(&mut self) -> bool {
        if self.is_dead() {
            return false;
        }
        self.state = HeartbeatState::Alive;
        true
    }

    fn next_probe(&mut self) -> HeartbeatAction {
        self.seq = self.seq.wrapping_add(1);
        HeartbeatAction::SendProbe(self.seq)
    }
}

/// How a heartbeat monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The session was torn down for another reason.
    Stopped,

    /// No ack arrived in time; the session was cancelled.
    Dead,
}

/// Drives a [`Heartbeat`] for one session on its own task.
pub struct HeartbeatMonitor {
    session_id: SessionId,
    heartbeat: Heartbeat,
    interval: Duration,
    acks: Arc<Notify>,
    probes: mpsc::Sender<Outgoing>,
    session: CancellationToken,
    dead: CancellationToken,
}

impl HeartbeatMonitor {
    /// `acks` is notified by the reader on every pong; `dead` and `session`
    /// are both cancelled when the session is declared dead.
    pub fn new(
        session_id: SessionId,
        interval: Duration,
        timeout: Duration,
        acks: Arc<Notify>,
        probes: mpsc::Sender<Outgoing>,
        session: CancellationToken,
        dead: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            heartbeat: Heartbeat::new(timeout),
            interval,
            acks,
            probes,
            session,
            dead,
        }
    }

    pub async fn run(mut self) -> HeartbeatOutcome {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.session.cancelled() => return HeartbeatOutcome::Stopped,

                _ = self.acks.notified() => {
                    if self.heartbeat.on_ack() {
                        debug!(session_id = %self.session_id, "Heartbeat acknowledged");
                    }
                }

                now = ticker.tick() => match self.heartbeat.on_tick(now) {
                    HeartbeatAction::Idle => {}
                    HeartbeatAction::SendProbe(seq) => {
                        // A full queue means the writer is stalled; the
                        // missing ack will be caught by the timeout.
                        if let Err(mpsc::error::TrySendError::Closed(_)) =
                            self.probes.try_send(Outgoing::Probe(seq))
                        {
                            return HeartbeatOutcome::Stopped;
                        }
                    }
                    HeartbeatAction::DeclareDead => {
                        warn!(session_id = %self.session_id, "Heartbeat timed out, closing session");
                        self.dead.cancel();
                        self.session.cancel();
                        return HeartbeatOutcome::Dead;
                    }
                },
            }
        }
    }
}
