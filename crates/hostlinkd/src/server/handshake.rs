//! Bounded HTTP upgrade handshake.
//!
//! The request head is read in fixed-size chunks until the blank line that
//! ends it. A head larger than the configured cap is rejected with HTTP 431
//! before any of it is parsed. Bytes read past the head are handed to the
//! WebSocket layer so a client that pipelines its first frame loses nothing.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;

use hostlink_core::{tokens_equal, BridgeConfig};
use hostlink_protocol::{ProtocolVersion, VersionError, VERSION_HEADER};

/// Time allowed for the client to deliver a complete request head.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const WEBSOCKET_VERSION: &str = "13";

/// Limits and expectations for the upgrade request.
#[derive(Debug, Clone)]
pub struct HandshakeSettings {
    pub path: String,
    pub max_header_bytes: usize,
    pub read_chunk_bytes: usize,
    pub max_message_bytes: usize,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl HandshakeSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            path: config.network.path.clone(),
            max_header_bytes: config.network.max_handshake_bytes,
            read_chunk_bytes: config.network.read_chunk_bytes,
            max_message_bytes: config.network.max_message_bytes,
            token: config.security.token.clone(),
            timeout: HANDSHAKE_TIMEOUT,
        }
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.max_message_bytes),
            max_frame_size: Some(self.max_message_bytes),
            ..Default::default()
        }
    }
}

/// A parsed and validated upgrade request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub protocol_version: Option<ProtocolVersion>,
    headers: HashMap<String, String>,
}

impl UpgradeRequest {
    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Errors that can occur while upgrading a connection.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Handshake headers exceed {max} bytes")]
    TooLarge { max: usize },

    #[error("Client closed the connection during the handshake")]
    Closed,

    #[error("Handshake timed out")]
    Timeout,

    #[error("I/O error during handshake: {0}")]
    Io(String),

    #[error("Malformed upgrade request: {0}")]
    Malformed(String),

    #[error("Method {method} not allowed")]
    MethodNotAllowed { method: String },

    #[error("No endpoint at {path}")]
    NotFound { path: String },

    #[error("Not a WebSocket upgrade: {0}")]
    NotUpgrade(String),

    #[error("Unsupported WebSocket version {version:?}")]
    UnsupportedVersion { version: Option<String> },

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("Protocol version rejected: {0}")]
    Protocol(#[from] VersionError),

    #[error("Too many sessions (max: {max})")]
    TooManySessions { max: usize },
}

impl HandshakeError {
    /// HTTP status returned to the client, if a response is sent at all.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            Self::TooLarge { .. } => Some((431, "Request Header Fields Too Large")),
            Self::Closed | Self::Io(_) => None,
            Self::Timeout => Some((408, "Request Timeout")),
            Self::Malformed(_) | Self::NotUpgrade(_) | Self::Protocol(_) => {
                Some((400, "Bad Request"))
            }
            Self::MethodNotAllowed { .. } => Some((405, "Method Not Allowed")),
            Self::NotFound { .. } => Some((404, "Not Found")),
            Self::UnsupportedVersion { .. } => Some((426, "Upgrade Required")),
            Self::Unauthorized => Some((401, "Unauthorized")),
            Self::TooManySessions { .. } => Some((503, "Service Unavailable")),
        }
    }

    /// Full HTTP rejection response, if one is sent.
    pub fn rejection_response(&self) -> Option<String> {
        let (code, reason) = self.status()?;
        let mut extra = String::new();
        match self {
            Self::UnsupportedVersion { .. } => {
                extra.push_str("Sec-WebSocket-Version: 13\r\n");
            }
            Self::Unauthorized => extra.push_str("WWW-Authenticate: Bearer\r\n"),
            _ => {}
        }
        let body = self.to_string();
        Some(format!(
            "HTTP/1.1 {code} {reason}\r\n{extra}Content-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ))
    }
}

/// Performs the upgrade on `stream`.
///
/// On rejection the HTTP error response is written and the stream dropped.
pub async fn accept<S>(
    mut stream: S,
    settings: &HandshakeSettings,
) -> Result<(WebSocketStream<S>, UpgradeRequest), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = tokio::time::timeout(settings.timeout, async {
        let (head, leftover) = read_request_head(&mut stream, settings).await?;
        let request = parse_request(&head)?;
        validate(&request, settings)?;
        Ok::<_, HandshakeError>((request, leftover))
    })
    .await
    .unwrap_or(Err(HandshakeError::Timeout));

    let (request, leftover) = match outcome {
        Ok(ok) => ok,
        Err(e) => {
            if let Some(response) = e.rejection_response() {
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
            return Err(e);
        }
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(request.key.as_bytes())
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| HandshakeError::Io(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| HandshakeError::Io(e.to_string()))?;

    let ws = WebSocketStream::from_partially_read(
        stream,
        leftover,
        Role::Server,
        Some(settings.websocket_config()),
    )
    .await;
    Ok((ws, request))
}

/// Reads the request head and answers it with the status for `reason`.
///
/// The head is consumed first so the client sees the response rather than
/// a reset. Returns `reason` for logging.
pub async fn reject<S>(mut stream: S, settings: &HandshakeSettings, reason: HandshakeError) -> HandshakeError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read = tokio::time::timeout(settings.timeout, read_request_head(&mut stream, settings)).await;
    if let Ok(Err(HandshakeError::Closed)) = read {
        return reason;
    }
    if let Some(response) = reason.rejection_response() {
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }
    reason
}

/// Reads until the end of the request head.
///
/// Returns the head (terminator included) and any bytes read past it.
pub async fn read_request_head<S>(
    stream: &mut S,
    settings: &HandshakeSettings,
) -> Result<(Vec<u8>, Vec<u8>), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let chunk_size = settings.read_chunk_bytes.max(1);
    let mut buf: Vec<u8> = Vec::with_capacity(chunk_size);
    let mut chunk = vec![0u8; chunk_size];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| HandshakeError::Io(e.to_string()))?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }

        // Rescan a few bytes before the new data in case the terminator spans chunks.
        let scan_from = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        buf.extend(chunk.iter().take(n));

        if let Some(end) = find_terminator(&buf, scan_from) {
            if end > settings.max_header_bytes {
                return Err(HandshakeError::TooLarge {
                    max: settings.max_header_bytes,
                });
            }
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }

        if buf.len() > settings.max_header_bytes {
            return Err(HandshakeError::TooLarge {
                max: settings.max_header_bytes,
            });
        }
    }
}

/// Offset just past the first terminator at or after `from`.
fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| from + pos + HEAD_TERMINATOR.len())
}

/// Parses a request head into its target and headers.
pub fn parse_request(head: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| HandshakeError::Malformed("request head is not UTF-8".to_string()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| HandshakeError::Malformed("empty request line".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => {
            return Err(HandshakeError::Malformed(format!(
                "bad request line: {request_line}"
            )))
        }
    };

    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::Malformed(format!("unsupported HTTP version {version}")));
    }
    if method != "GET" {
        return Err(HandshakeError::MethodNotAllowed {
            method: method.to_string(),
        });
    }

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {line}")))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let path = target.split('?').next().unwrap_or(target).to_string();
    let key = headers.get("sec-websocket-key").cloned().unwrap_or_default();
    let protocol_version = headers
        .get(VERSION_HEADER)
        .and_then(|v| ProtocolVersion::parse(v).ok());

    Ok(UpgradeRequest {
        path,
        key,
        protocol_version,
        headers,
    })
}

/// Checks path, upgrade headers, bearer token and protocol version, in that order.
fn validate(request: &UpgradeRequest, settings: &HandshakeSettings) -> Result<(), HandshakeError> {
    if request.path != settings.path {
        return Err(HandshakeError::NotFound {
            path: request.path.clone(),
        });
    }

    let upgrade = request.header("upgrade").unwrap_or_default();
    if !has_token(upgrade, "websocket") {
        return Err(HandshakeError::NotUpgrade("missing Upgrade: websocket".to_string()));
    }
    let connection = request.header("connection").unwrap_or_default();
    if !has_token(connection, "upgrade") {
        return Err(HandshakeError::NotUpgrade("missing Connection: Upgrade".to_string()));
    }

    let version = request.header("sec-websocket-version");
    if version != Some(WEBSOCKET_VERSION) {
        return Err(HandshakeError::UnsupportedVersion {
            version: version.map(str::to_string),
        });
    }

    if request.key.is_empty() {
        return Err(HandshakeError::NotUpgrade("missing Sec-WebSocket-Key".to_string()));
    }

    if let Some(expected) = settings.token.as_deref().filter(|t| !t.is_empty()) {
        let presented = request
            .header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .unwrap_or_default();
        if !tokens_equal(presented, expected) {
            return Err(HandshakeError::Unauthorized);
        }
    }

    if let Some(announced) = request.header(VERSION_HEADER) {
        ProtocolVersion::check_client(announced)?;
    }

    Ok(())
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn settings() -> HandshakeSettings {
        HandshakeSettings::from_config(&BridgeConfig::default())
    }

    fn upgrade_request(path: &str, extra: &str) -> String {
        format!(
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n{extra}\r\n"
        )
    }

    async fn respond(request: Vec<u8>, settings: HandshakeSettings) -> (String, bool) {
        let (mut client, server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move { accept(server, &settings).await.is_ok() });

        client.write_all(&request).await.unwrap();
        let accepted = server_task.await.unwrap();

        let mut response = vec![0u8; 4096];
        let n = client.read(&mut response).await.unwrap();
        (String::from_utf8_lossy(&response[..n]).to_string(), accepted)
    }

    #[test]
    fn test_parse_request_headers() {
        let head = upgrade_request("/bridge?client=agent", "X-Hostlink-Protocol: 1.0\r\n");
        let request = parse_request(head.as_bytes()).unwrap();
        assert_eq!(request.path, "/bridge");
        assert_eq!(request.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(request.header("UPGRADE"), Some("websocket"));
        assert_eq!(request.header(VERSION_HEADER), Some("1.0"));
        assert_eq!(request.protocol_version, Some(ProtocolVersion::new(1, 0)));
    }

    #[test]
    fn test_parse_rejects_non_get() {
        let err = parse_request(b"POST /bridge HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, HandshakeError::MethodNotAllowed { .. }));
    }

    #[test]
    fn test_validate_checks_token() {
        let mut settings = settings();
        settings.token = Some("secret-token-1234".to_string());

        let head = upgrade_request("/bridge", "");
        let request = parse_request(head.as_bytes()).unwrap();
        assert!(matches!(
            validate(&request, &settings),
            Err(HandshakeError::Unauthorized)
        ));

        let head = upgrade_request("/bridge", "Authorization: Bearer secret-token-1234\r\n");
        let request = parse_request(head.as_bytes()).unwrap();
        assert!(validate(&request, &settings).is_ok());
    }

    #[test]
    fn test_validate_rejects_incompatible_protocol() {
        let head = upgrade_request("/bridge", "X-Hostlink-Protocol: 2.0\r\n");
        let request = parse_request(head.as_bytes()).unwrap();
        let err = validate(&request, &settings()).unwrap_err();
        assert_eq!(err.status().map(|(code, _)| code), Some(400));
    }

    #[test]
    fn test_terminator_split_across_chunks() {
        let buf = b"GET / HTTP/1.1\r\n\r\nrest";
        assert_eq!(find_terminator(buf, 11), Some(18));
        assert_eq!(find_terminator(buf, 14), Some(18));
        assert_eq!(find_terminator(buf, 15), None);
    }

    #[tokio::test]
    async fn test_upgrade_accepted() {
        let (response, accepted) =
            respond(upgrade_request("/bridge", "").into_bytes(), settings()).await;
        assert!(accepted);
        assert!(response.starts_with("HTTP/1.1 101"));
        // RFC 6455 sample key/accept pair.
        assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[tokio::test]
    async fn test_wrong_path_is_404() {
        let (response, accepted) =
            respond(upgrade_request("/other", "").into_bytes(), settings()).await;
        assert!(!accepted);
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_oversized_head_is_431() {
        let mut request = b"GET /bridge HTTP/1.1\r\n".to_vec();
        while request.len() <= 16 * 1024 {
            request.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }

        let (response, accepted) = respond(request, settings()).await;
        assert!(!accepted);
        assert!(response.starts_with("HTTP/1.1 431"));
    }

    #[tokio::test]
    async fn test_head_at_cap_is_accepted() {
        let mut settings = settings();
        let base = upgrade_request("/bridge", "");
        settings.max_header_bytes = base.len();
        settings.read_chunk_bytes = 7;

        let (response, accepted) = respond(base.into_bytes(), settings).await;
        assert!(accepted);
        assert!(response.starts_with("HTTP/1.1 101"));
    }

    #[tokio::test]
    async fn test_missing_version_is_426() {
        let request = "GET /bridge HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let (response, accepted) = respond(request.as_bytes().to_vec(), settings()).await;
        assert!(!accepted);
        assert!(response.starts_with("HTTP/1.1 426"));
        assert!(response.contains("Sec-WebSocket-Version: 13"));
    }

    #[tokio::test]
    async fn test_reject_answers_with_503() {
        let (mut client, server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            reject(server, &settings(), HandshakeError::TooManySessions { max: 2 }).await
        });

        client
            .write_all(upgrade_request("/bridge", "").as_bytes())
            .await
            .unwrap();
        let reason = server_task.await.unwrap();
        assert!(matches!(reason, HandshakeError::TooManySessions { max: 2 }));

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503"), "got: {response}");
        assert!(response.contains("Too many sessions (max: 2)"));
    }
}
