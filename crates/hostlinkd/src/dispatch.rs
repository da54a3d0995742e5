//! Request dispatch.
//!
//! Turns a [`RequestEnvelope`] into a [`ResponseEnvelope`]. Every failure,
//! including a handler panic or timeout, ends up as an error envelope; nothing
//! propagates past [`Dispatcher::handle`].

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinError;
use tracing::{debug, warn};

use hostlink_core::{redact_secrets, BridgeError, BridgeResult, Payload, SharedHandler};
use hostlink_protocol::{RequestEnvelope, ResponseEnvelope};

use crate::compilation::{CompilationCoordinator, WriteJob};
use crate::registry::CommandRegistry;
use crate::server::SessionId;

/// Callback invoked after a successful write-classified operation.
pub type RefreshHook = Arc<dyn Fn() + Send + Sync>;

/// Routes requests to handlers.
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    coordinator: CompilationCoordinator,
    command_timeout: Duration,
    refresh_hook: Option<RefreshHook>,
    secrets: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        coordinator: CompilationCoordinator,
        command_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            coordinator,
            command_timeout,
            refresh_hook: None,
            secrets: Vec::new(),
        }
    }

    pub fn with_refresh_hook(mut self, hook: Option<RefreshHook>) -> Self {
        self.refresh_hook = hook;
        self
    }

    /// Secrets masked out of every error message.
    pub fn with_secrets(mut self, secrets: impl IntoIterator<Item = String>) -> Self {
        self.secrets = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        self
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Handles one request on behalf of `origin`.
    pub async fn handle(&self, request: RequestEnvelope, origin: &SessionId) -> ResponseEnvelope {
        let request_id = request.request_id.clone();
        let command = request.command.clone();

        match self.route(request, origin).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    session_id = %origin,
                    request_id = ?request_id,
                    command = %command,
                    kind = %e.kind(),
                    error = %self.redact(&e.to_string()),
                    "Request failed"
                );
                self.failure(request_id, &e)
            }
        }
    }

    async fn route(
        &self,
        request: RequestEnvelope,
        origin: &SessionId,
    ) -> BridgeResult<ResponseEnvelope> {
        let handler = self.registry.resolve(&request.command)?;

        let operation = request
            .operation_name()
            .map(str::to_string)
            .ok_or_else(|| BridgeError::missing_field("operation"))?;

        if !handler.supports(&operation) {
            return Err(BridgeError::UnknownOperation {
                command: request.command,
                operation,
            });
        }

        let RequestEnvelope {
            request_id,
            command,
            payload,
            ..
        } = request;
        let payload = Payload::from_value(payload)?;

        if handler.requires_compilation_wait(&operation) {
            debug!(command = %command, operation = %operation, "Routing through compilation coordinator");
            let response = self
                .coordinator
                .execute(WriteJob {
                    request_id,
                    session_id: origin.clone(),
                    command,
                    operation,
                    handler,
                    payload,
                })
                .await;

            if response.success {
                if let Some(hook) = &self.refresh_hook {
                    hook();
                }
                Ok(response)
            } else {
                Ok(self.redact_envelope(response))
            }
        } else {
            let value = execute_guarded(handler, operation, payload, self.command_timeout).await?;
            Ok(ResponseEnvelope::success(request_id, value))
        }
    }

    fn redact(&self, text: &str) -> String {
        let secrets: Vec<&str> = self.secrets.iter().map(String::as_str).collect();
        redact_secrets(text, &secrets)
    }

    fn failure(&self, request_id: Option<String>, error: &BridgeError) -> ResponseEnvelope {
        ResponseEnvelope::failure_with_message(
            request_id,
            error.kind(),
            self.redact(&error.to_string()),
        )
    }

    fn redact_envelope(&self, mut response: ResponseEnvelope) -> ResponseEnvelope {
        if let Some(error) = response.error.as_mut() {
            error.message = self.redact(&error.message);
        }
        response
    }
}

/// Runs a handler on the blocking pool under `limit`.
///
/// Panics become `HandlerError`; exceeding `limit` becomes `Timeout`. A
/// timed-out handler keeps running on its blocking thread, its result is
/// discarded.
pub(crate) async fn execute_guarded(
    handler: SharedHandler,
    operation: String,
    payload: Payload,
    limit: Duration,
) -> BridgeResult<Value> {
    let op = operation.clone();
    let task = tokio::task::spawn_blocking(move || handler.execute(&op, &payload));

    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(BridgeError::handler(join_message(join))),
        Err(_) => Err(BridgeError::Timeout {
            operation,
            elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

fn join_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => format!("handler panicked: {}", panic_text(payload.as_ref())),
        Err(_) => "handler task failed".to_string(),
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compilation::{CoordinatorSettings, MemoryStore};
    use crate::host::HostSignals;
    use crate::registry::{initialize_registry, Registration};
    use hostlink_core::{CommandHandler, ErrorKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Inventory;

    impl CommandHandler for Inventory {
        fn category(&self) -> &str {
            "items"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn supported_operations(&self) -> &[&str] {
            &["list", "count", "save", "explode", "stall", "leak"]
        }
        fn requires_compilation_wait(&self, operation: &str) -> bool {
            operation == "save"
        }
        fn execute(&self, operation: &str, payload: &Payload) -> BridgeResult<Value> {
            match operation {
                "list" => Ok(json!({ "items": ["sword", "shield"] })),
                "count" => Ok(json!(2)),
                "save" => Ok(json!({ "saved": payload.require_str("name")? })),
                "explode" => panic!("boom"),
                "stall" => {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(json!({}))
                }
                "leak" => Err(BridgeError::handler("token sk-live-abcdef123456 rejected")),
                _ => Err(BridgeError::handler("unreachable operation")),
            }
        }
    }

    fn dispatcher(command_timeout: Duration) -> (Dispatcher, Arc<AtomicUsize>) {
        let registry = Arc::new(CommandRegistry::new());
        initialize_registry(&registry, vec![Registration::new("items", Arc::new(Inventory))])
            .unwrap();

        let coordinator = CompilationCoordinator::new(
            Arc::new(MemoryStore::new()),
            HostSignals::new(),
            CoordinatorSettings {
                max_wait: Duration::from_secs(30),
                command_timeout,
            },
            CancellationToken::new(),
        );

        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&refreshes);
        let hook: RefreshHook = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let dispatcher = Dispatcher::new(registry, coordinator, command_timeout)
            .with_refresh_hook(Some(hook))
            .with_secrets(vec!["sk-live-abcdef123456".to_string()]);
        (dispatcher, refreshes)
    }

    fn request(command: &str, operation: &str, payload: Value) -> RequestEnvelope {
        RequestEnvelope::new("r-1", command, operation, payload)
    }

    fn origin() -> SessionId {
        SessionId::new("session-test")
    }

    #[tokio::test]
    async fn test_object_result_is_flattened() {
        let (dispatcher, _) = dispatcher(Duration::from_secs(5));
        let response = dispatcher
            .handle(request("items", "list", json!({})), &origin())
            .await;
        assert!(response.success);
        assert_eq!(response.request_id.as_deref(), Some("r-1"));
        assert_eq!(response.result.get("items"), Some(&json!(["sword", "shield"])));
    }

    #[tokio::test]
    async fn test_scalar_result_goes_under_result() {
        let (dispatcher, _) = dispatcher(Duration::from_secs(5));
        let response = dispatcher
            .handle(request("items", "count", json!({})), &origin())
            .await;
        assert_eq!(response.result.get("result"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_unknown_command_and_operation() {
        let (dispatcher, _) = dispatcher(Duration::from_secs(5));

        let response = dispatcher
            .handle(request("weapons", "list", json!({})), &origin())
            .await;
        assert_eq!(response.error_kind(), Some(ErrorKind::NotFound));

        let response = dispatcher
            .handle(request("items", "melt", json!({})), &origin())
            .await;
        assert_eq!(response.error_kind(), Some(ErrorKind::UnknownOperation));
    }

    #[tokio::test]
    async fn test_missing_operation_names_the_field() {
        let (dispatcher, _) = dispatcher(Duration::from_secs(5));
        let mut req = request("items", "list", json!({}));
        req.operation = None;

        let response = dispatcher.handle(req, &origin()).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::ValidationError));
        assert!(response.error.unwrap().message.contains("operation"));
    }

    #[tokio::test]
    async fn test_operation_from_payload() {
        let (dispatcher, _) = dispatcher(Duration::from_secs(5));
        let mut req = request("items", "list", json!({ "operation": "count" }));
        req.operation = None;

        let response = dispatcher.handle(req, &origin()).await;
        assert_eq!(response.result.get("result"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_panic_becomes_handler_error() {
        let (dispatcher, _) = dispatcher(Duration::from_secs(5));
        let response = dispatcher
            .handle(request("items", "explode", json!({})), &origin())
            .await;
        assert_eq!(response.error_kind(), Some(ErrorKind::HandlerError));
        assert!(response.error.unwrap().message.contains("boom"));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let (dispatcher, _) = dispatcher(Duration::from_millis(50));
        let response = dispatcher
            .handle(request("items", "stall", json!({})), &origin())
            .await;
        assert_eq!(response.error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_secrets_are_masked() {
        let (dispatcher, _) = dispatcher(Duration::from_secs(5));
        let response = dispatcher
            .handle(request("items", "leak", json!({})), &origin())
            .await;
        let message = response.error.unwrap().message;
        assert!(!message.contains("sk-live-abcdef123456"));
        assert!(message.contains("****3456"));
    }

    #[tokio::test]
    async fn test_write_runs_refresh_hook() {
        let (dispatcher, refreshes) = dispatcher(Duration::from_secs(5));

        let response = dispatcher
            .handle(request("items", "save", json!({ "name": "potion" })), &origin())
            .await;
        assert!(response.success);
        assert_eq!(response.result.get("saved"), Some(&json!("potion")));
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);

        let response = dispatcher
            .handle(request("items", "save", json!({})), &origin())
            .await;
        assert_eq!(response.error_kind(), Some(ErrorKind::ValidationError));
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);

        dispatcher
            .handle(request("items", "list", json!({})), &origin())
            .await;
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }
}
