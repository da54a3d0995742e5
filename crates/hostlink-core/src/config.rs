//! Bridge configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all) yields a
//! working configuration. Environment variables override file values.
//!
//! ```toml
//! [network]
//! port = 7070
//!
//! [security]
//! project_root = "/srv/game"
//! token = "change-me"
//!
//! [compilation]
//! max_wait_ms = 30000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed upgrade path for the bridge endpoint.
pub const BRIDGE_PATH: &str = "/bridge";

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 7070;

/// Maximum size of the HTTP upgrade request headers (16 KiB).
pub const MAX_HANDSHAKE_HEADER_BYTES: usize = 16 * 1024;

/// Read chunk used while collecting upgrade headers (4 KiB).
pub const HTTP_READ_CHUNK_BYTES: usize = 4096;

/// Maximum size of a single message (2 MiB).
pub const MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;

/// Maximum number of concurrent client sessions.
pub const MAX_SESSIONS: usize = 16;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub const MAX_SEND_ATTEMPTS: u32 = 3;
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on how long a compilation-await record stays outstanding.
pub const COMPILATION_MAX_WAIT: Duration = Duration::from_secs(30);

/// Delay between a rebuild request and runtime teardown.
pub const REBUILD_GRACE: Duration = Duration::from_millis(250);

/// Environment variables recognised by [`BridgeConfig::apply_env`].
pub const ENV_CONFIG: &str = "HOSTLINK_CONFIG";
pub const ENV_HOST: &str = "HOSTLINK_HOST";
pub const ENV_PORT: &str = "HOSTLINK_PORT";
pub const ENV_TOKEN: &str = "HOSTLINK_TOKEN";
pub const ENV_PROJECT_ROOT: &str = "HOSTLINK_PROJECT_ROOT";
pub const ENV_STATE_DIR: &str = "HOSTLINK_STATE_DIR";

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub retry: RetryConfig,
    pub compilation: CompilationConfig,
    pub security: SecurityConfig,
    pub storage: StorageConfig,
    pub host: HostConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_handshake_bytes: usize,
    pub read_chunk_bytes: usize,
    pub max_message_bytes: usize,
    pub max_sessions: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            path: BRIDGE_PATH.to_string(),
            max_handshake_bytes: MAX_HANDSHAKE_HEADER_BYTES,
            read_chunk_bytes: HTTP_READ_CHUNK_BYTES,
            max_message_bytes: MAX_MESSAGE_BYTES,
            max_sessions: MAX_SESSIONS,
        }
    }
}

impl NetworkConfig {
    /// Returns `host:port` for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: millis(HEARTBEAT_INTERVAL),
            heartbeat_timeout_ms: millis(HEARTBEAT_TIMEOUT),
            send_timeout_ms: millis(SEND_TIMEOUT),
            command_timeout_ms: millis(DEFAULT_COMMAND_TIMEOUT),
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_send_attempts: u32,
    pub send_retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: MAX_SEND_ATTEMPTS,
            send_retry_delay_ms: millis(SEND_RETRY_DELAY),
        }
    }
}

impl RetryConfig {
    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilationConfig {
    pub max_wait_ms: u64,
    pub rebuild_grace_ms: u64,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: millis(COMPILATION_MAX_WAIT),
            rebuild_grace_ms: millis(REBUILD_GRACE),
        }
    }
}

impl CompilationConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn rebuild_grace(&self) -> Duration {
        Duration::from_millis(self.rebuild_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Root that every path argument must stay inside.
    pub project_root: PathBuf,

    /// Bearer token required on the upgrade request (None = no auth).
    pub token: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the durable compilation-await record.
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

impl StorageConfig {
    /// Path of the durable key/value file.
    pub fn compilation_store_path(&self) -> PathBuf {
        self.state_dir.join("compilation.json")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// File extensions whose modification makes the host rebuild.
    pub rebuild_extensions: Vec<String>,

    /// Subdirectory of the project root owned by the document handler.
    pub documents_dir: String,

    /// Program and arguments run in the project root during a rebuild.
    /// Empty means the rebuild only reloads configuration.
    pub rebuild_command: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            rebuild_extensions: vec!["cs".to_string()],
            documents_dir: "Storage".to_string(),
            rebuild_command: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Returns true if writing `path` should trigger a host rebuild.
    pub fn triggers_rebuild(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.rebuild_extensions
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(ext))
            })
    }
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl BridgeConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads configuration from `path` (or defaults when `None`) and validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.network.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.network.port = port.parse().map_err(|_| ConfigError::Env {
                var: ENV_PORT.to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.security.token = if token.is_empty() { None } else { Some(token) };
        }
        if let Some(root) = lookup(ENV_PROJECT_ROOT) {
            self.security.project_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.storage.state_dir = PathBuf::from(dir);
        }
        self.validate()
    }

    /// Applies overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|var| std::env::var(var).ok())
    }

    /// Rejects configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("network.max_handshake_bytes", self.network.max_handshake_bytes as u64),
            ("network.read_chunk_bytes", self.network.read_chunk_bytes as u64),
            ("network.max_message_bytes", self.network.max_message_bytes as u64),
            ("network.max_sessions", self.network.max_sessions as u64),
            ("timing.heartbeat_interval_ms", self.timing.heartbeat_interval_ms),
            ("timing.heartbeat_timeout_ms", self.timing.heartbeat_timeout_ms),
            ("timing.send_timeout_ms", self.timing.send_timeout_ms),
            ("timing.command_timeout_ms", self.timing.command_timeout_ms),
            ("retry.max_send_attempts", u64::from(self.retry.max_send_attempts)),
            ("compilation.max_wait_ms", self.compilation.max_wait_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        if self.timing.heartbeat_interval_ms >= self.timing.heartbeat_timeout_ms {
            return Err(invalid(
                "timing.heartbeat_interval_ms",
                "must be smaller than timing.heartbeat_timeout_ms",
            ));
        }

        if self.network.read_chunk_bytes > self.network.max_handshake_bytes {
            return Err(invalid(
                "network.read_chunk_bytes",
                "must not exceed network.max_handshake_bytes",
            ));
        }

        if !self.network.path.starts_with('/') {
            return Err(invalid("network.path", "must start with '/'"));
        }

        if self
            .host
            .rebuild_command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(invalid("host.rebuild_command", "program must not be empty"));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("hostlink")
}
