use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use hostlink_core::{BridgeError, BridgeResult, CommandHandler, Payload};

use crate::compilation::{CompilationRecord, DurableStore};
use crate::host::HostSignals;

/// Wait used when the caller does not pass `timeoutSeconds`.
const DEFAULT_AWAIT_SECONDS: u64 = 20;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Margin kept between the await budget and the dispatcher's command timeout.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(1);

/// Reports and waits on the host's rebuild phase.
pub struct CompilationAwaitHandler {
    host: HostSignals,
    store: Arc<dyn DurableStore>,
    command_timeout: Duration,
}

impl CompilationAwaitHandler {
    pub fn new(host: HostSignals, store: Arc<dyn DurableStore>, command_timeout: Duration) -> Self {
        Self {
            host,
            store,
            command_timeout,
        }
    }

    fn status(&self) -> BridgeResult<Value> {
        let phase = self.host.phase();
        let record = CompilationRecord::load(self.store.as_ref())
            .map_err(|e| BridgeError::handler(e.to_string()))?;

        Ok(json!({
            "phase": phase.label(),
            "rebuilding": phase.is_rebuilding(),
            "lastFailure": self.host.last_failure(),
            "pendingRequest": record.as_ref().and_then(|r| r.request_id()),
            "hasPendingRecord": record.is_some(),
        }))
    }

    /// Blocks the calling worker until the host leaves `Rebuilding` or the budget runs out.
    fn await_rebuild(&self, payload: &Payload) -> BridgeResult<Value> {
        let requested = payload.optional_u64("timeoutSeconds")?.unwrap_or(DEFAULT_AWAIT_SECONDS);
        if requested == 0 {
            return Err(BridgeError::invalid_field("timeoutSeconds", "must be at least 1"));
        }
        let ceiling = self.command_timeout.saturating_sub(TIMEOUT_MARGIN);
        let budget = Duration::from_secs(requested).min(ceiling);

        let start = Instant::now();
        let mut timed_out = false;
        while self.host.is_rebuilding() {
            if start.elapsed() >= budget {
                timed_out = true;
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let failure = if timed_out { None } else { self.host.last_failure() };
        Ok(json!({
            "compiled": !timed_out && failure.is_none(),
            "failure": failure,
            "timedOut": timed_out,
            "waitedMs": u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        }))
    }
}

impl CommandHandler for CompilationAwaitHandler {
    fn category(&self) -> &str {
        "compilation"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn supported_operations(&self) -> &[&str] {
        &["await", "status"]
    }

    fn requires_compilation_wait(&self, _operation: &str) -> bool {
        false
    }

    fn execute(&self, operation: &str, payload: &Payload) -> BridgeResult<Value> {
        match operation {
            "await" => self.await_rebuild(payload),
            "status" => self.status(),
            other => Err(BridgeError::UnknownOperation {
                command: "compilationAwait".to_string(),
                operation: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compilation::{MemoryStore, PendingResult};
    use chrono::Utc;

    fn handler() -> (CompilationAwaitHandler, HostSignals, Arc<MemoryStore>) {
        let host = HostSignals::new();
        let store = Arc::new(MemoryStore::new());
        let handler = CompilationAwaitHandler::new(
            host.clone(),
            store.clone(),
            Duration::from_secs(30),
        );
        (handler, host, store)
    }

    fn payload(value: Value) -> Payload {
        Payload::from_value(value).unwrap()
    }

    #[test]
    fn test_status_reports_phase_and_record() {
        let (handler, host, store) = handler();
        let status = handler.execute("status", &Payload::new()).unwrap();
        assert_eq!(status["phase"], "running");
        assert_eq!(status["hasPendingRecord"], false);

        host.request_rebuild("test");
        CompilationRecord::begin(
            PendingResult {
                request_id: Some("r-9".to_string()),
                session_id: "session-1".to_string(),
                command: "documents".to_string(),
                operation: "put".to_string(),
                result: None,
            },
            Utc::now(),
        )
        .save(store.as_ref())
        .unwrap();

        let status = handler.execute("status", &Payload::new()).unwrap();
        assert_eq!(status["phase"], "rebuilding");
        assert_eq!(status["hasPendingRecord"], true);
        assert_eq!(status["pendingRequest"], "r-9");
    }

    #[test]
    fn test_await_returns_immediately_when_not_rebuilding() {
        let (handler, _host, _store) = handler();
        let result = handler.execute("await", &Payload::new()).unwrap();
        assert_eq!(result["compiled"], true);
        assert_eq!(result["timedOut"], false);
    }

    #[test]
    fn test_await_sees_finished_rebuild_failure() {
        let (handler, host, _store) = handler();
        host.request_rebuild("test");

        let finisher = {
            let host = host.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(250));
                host.finish_rebuild(Err("syntax error in main".to_string()));
            })
        };

        let result = handler
            .execute("await", &payload(json!({ "timeoutSeconds": 5 })))
            .unwrap();
        finisher.join().unwrap();

        assert_eq!(result["compiled"], false);
        assert_eq!(result["timedOut"], false);
        assert_eq!(result["failure"], "syntax error in main");
    }

    #[test]
    fn test_await_times_out() {
        let (handler, host, _store) = handler();
        host.request_rebuild("never finishes");

        let result = handler
            .execute("await", &payload(json!({ "timeoutSeconds": 1 })))
            .unwrap();
        assert_eq!(result["timedOut"], true);
        assert_eq!(result["compiled"], false);
        assert!(result["waitedMs"].as_u64().unwrap() >= 1000);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let (handler, _host, _store) = handler();
        let err = handler
            .execute("await", &payload(json!({ "timeoutSeconds": 0 })))
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "ValidationError");
    }
}
