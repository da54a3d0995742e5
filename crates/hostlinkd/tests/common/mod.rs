//! Shared helpers for the bridge integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use hostlink_core::BridgeConfig;
use hostlinkd::compilation::MemoryStore;
use hostlinkd::{BridgeDeps, BridgeRuntime, HostSignals};

/// How long a test waits for any single frame.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Test server context that manages runtime lifecycle and cleanup.
pub struct TestServer {
    runtime: Option<BridgeRuntime>,
    pub config: BridgeConfig,
    pub host: HostSignals,
    pub store: Arc<MemoryStore>,
    deps: BridgeDeps,
    _project: TempDir, // Keep alive for RAII cleanup
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawns a server after letting `configure` adjust the test config.
    pub async fn spawn_with(configure: impl FnOnce(&mut BridgeConfig)) -> Self {
        Self::spawn_with_deps(configure, |deps| deps).await
    }

    /// Like [`TestServer::spawn_with`], also letting `extend` add handlers.
    pub async fn spawn_with_deps(
        configure: impl FnOnce(&mut BridgeConfig),
        extend: impl FnOnce(BridgeDeps) -> BridgeDeps,
    ) -> Self {
        let project = tempfile::tempdir().expect("create project dir");

        let mut config = BridgeConfig::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = 0;
        config.security.project_root = project.path().to_path_buf();
        config.storage.state_dir = project.path().join(".state");
        config.host.documents_dir = "docs".to_string();
        config.host.rebuild_extensions = vec!["cs".to_string()];
        configure(&mut config);
        config.validate().expect("valid test config");

        let host = HostSignals::new();
        let store = Arc::new(MemoryStore::new());
        let deps = extend(BridgeDeps::new(host.clone(), store.clone()));

        let runtime = BridgeRuntime::start(&config, &deps)
            .await
            .expect("start bridge runtime");

        Self {
            runtime: Some(runtime),
            config,
            host,
            store,
            deps,
            _project: project,
        }
    }

    fn runtime(&self) -> &BridgeRuntime {
        self.runtime.as_ref().expect("runtime is running")
    }

    pub fn addr(&self) -> SocketAddr {
        self.runtime().local_addr()
    }

    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr(), self.config.network.path)
    }

    pub async fn session_count(&self) -> usize {
        self.runtime().session_count().await
    }

    pub fn handler_count(&self) -> usize {
        self.runtime().registry().len()
    }

    pub fn has_pending(&self) -> bool {
        self.runtime().coordinator().has_pending()
    }

    /// Connects a client and consumes its welcome message.
    pub async fn connect(&self) -> TestClient {
        self.try_connect(None).await.expect("connect to bridge")
    }

    /// Connects, optionally presenting a bearer token.
    pub async fn try_connect(&self, token: Option<&str>) -> Result<TestClient, WsError> {
        let mut request = self.url().into_client_request()?;
        if let Some(token) = token {
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {token}")).expect("header value"),
            );
        }
        let (ws, _response) = connect_async(request).await?;
        let mut client = TestClient { ws, session_id: String::new() };

        let welcome = client.recv().await.expect("welcome message");
        assert_eq!(welcome["type"], "welcome");
        client.session_id = welcome["sessionId"].as_str().unwrap_or_default().to_string();
        Ok(client)
    }

    /// Tears the runtime down, as the host does when a rebuild starts.
    pub async fn stop_runtime(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await;
        }
    }

    /// Starts a fresh runtime on the same durable store and host signals.
    pub async fn start_runtime(&mut self) {
        assert!(self.runtime.is_none(), "runtime already running");
        let runtime = BridgeRuntime::start(&self.config, &self.deps)
            .await
            .expect("restart bridge runtime");
        self.runtime = Some(runtime);
    }

    pub async fn shutdown(mut self) {
        self.stop_runtime().await;
    }

    /// Path of a document inside the test project.
    pub fn document_path(&self, relative: &str) -> std::path::PathBuf {
        self.config
            .security
            .project_root
            .join(&self.config.host.documents_dir)
            .join(relative)
    }
}

/// WebSocket client with protocol helpers.
pub struct TestClient {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub session_id: String,
}

impl TestClient {
    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("send frame");
    }

    pub async fn send_command(&mut self, request_id: &str, command: &str, operation: &str, payload: Value) {
        self.send_json(json!({
            "type": "command",
            "requestId": request_id,
            "command": command,
            "operation": operation,
            "payload": payload,
        }))
        .await;
    }

    /// Next JSON message, skipping control frames. `None` once the server closes.
    pub async fn recv(&mut self) -> Option<Value> {
        self.recv_within(RECV_TIMEOUT).await
    }

    pub async fn recv_within(&mut self, limit: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("server sent JSON"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Sends a command and waits for the response carrying its request id.
    pub async fn request(&mut self, request_id: &str, command: &str, operation: &str, payload: Value) -> Value {
        self.send_command(request_id, command, operation, payload).await;
        self.response_for(request_id).await
    }

    pub async fn response_for(&mut self, request_id: &str) -> Value {
        loop {
            let msg = self.recv().await.expect("response before close");
            if msg["type"] == "response" && msg["requestId"] == request_id {
                return msg;
            }
        }
    }

    /// True once the server has closed the connection.
    pub async fn is_closed_within(&mut self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Polls `condition` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
