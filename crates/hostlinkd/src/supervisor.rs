//! Host lifecycle loop.
//!
//! ```text
//!   start runtime ──▶ serve ──rebuild requested──▶ grace ──▶ shutdown runtime
//!        ▲                                                        │
//!        └──── finish_rebuild(outcome) ◀── rebuild command + reload config
//! ```
//!
//! The durable store and [`HostSignals`] outlive every runtime; everything
//! else is rebuilt from scratch on each pass.

use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostlink_core::{BridgeConfig, ConfigError};

use crate::bridge::{BridgeDeps, BridgeRuntime};
use crate::host::wait_for_rebuild;
use crate::server::ServerError;

/// Produces a fresh configuration after a rebuild.
pub type ConfigLoader = Arc<dyn Fn() -> Result<BridgeConfig, ConfigError> + Send + Sync>;

/// Owns the bridge runtime across host rebuilds.
pub struct HostSupervisor {
    config: BridgeConfig,
    reload: Option<ConfigLoader>,
    deps: BridgeDeps,
    shutdown: CancellationToken,
}

impl HostSupervisor {
    pub fn new(config: BridgeConfig, deps: BridgeDeps, shutdown: CancellationToken) -> Self {
        Self {
            config,
            reload: None,
            deps,
            shutdown,
        }
    }

    /// Reloads configuration with `loader` after every rebuild.
    pub fn with_reload(mut self, loader: ConfigLoader) -> Self {
        self.reload = Some(loader);
        self
    }

    /// Serves until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if a runtime cannot be started (bind failure or
    /// invalid handler set). The host is left in its current phase.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut phases = self.deps.host.subscribe();

        loop {
            let runtime = BridgeRuntime::start(&self.config, &self.deps).await?;

            let reason = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                reason = wait_for_rebuild(&mut phases) => reason,
            };

            let Some(reason) = reason else {
                info!("Host shutting down");
                runtime.shutdown().await;
                return Ok(());
            };

            info!(reason = %reason, "Tearing down bridge for host rebuild");
            let shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.config.compilation.rebuild_grace()) => {}
            }
            runtime.shutdown().await;

            // The durable record stays behind for the next start.
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => None,
                outcome = self.rebuild() => Some(outcome),
            };
            let Some(outcome) = outcome else {
                info!("Host shutting down during rebuild");
                return Ok(());
            };
            self.deps.host.finish_rebuild(outcome);

            if self.shutdown.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn rebuild(&mut self) -> Result<(), String> {
        if let Some((program, args)) = self.config.host.rebuild_command.split_first() {
            debug!(program = %program, "Running rebuild command");
            let output = Command::new(program)
                .args(args)
                .current_dir(&self.config.security.project_root)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| format!("failed to run {program}: {e}"))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(format!("{program} exited with {}: {}", output.status, stderr.trim()));
            }
        }

        if let Some(reload) = &self.reload {
            match reload() {
                Ok(config) => self.config = config,
                Err(e) => {
                    warn!(error = %e, "Keeping previous configuration");
                    return Err(format!("configuration reload failed: {e}"));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compilation::MemoryStore;
    use crate::host::{HostPhase, HostSignals};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = 0;
        config.compilation.rebuild_grace_ms = 10;
        config
    }

    async fn wait_for_phase(host: &HostSignals, label: &str) {
        let mut rx = host.subscribe();
        tokio::time::timeout(Duration::from_secs(10), async {
            while rx.borrow_and_update().label() != label {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_cycle_reloads_config() {
        let host = HostSignals::new();
        let deps = BridgeDeps::new(host.clone(), Arc::new(MemoryStore::new()));
        let shutdown = CancellationToken::new();

        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reloads);
        let loader: ConfigLoader = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(config())
        });

        let supervisor = HostSupervisor::new(config(), deps, shutdown.clone()).with_reload(loader);
        let handle = tokio::spawn(supervisor.run());

        host.request_rebuild("test");
        wait_for_phase(&host, "rebuilt").await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_reload_reports_rebuild_failure() {
        let host = HostSignals::new();
        let deps = BridgeDeps::new(host.clone(), Arc::new(MemoryStore::new()));
        let shutdown = CancellationToken::new();

        let loader: ConfigLoader = Arc::new(|| {
            Err(ConfigError::Invalid {
                field: "network.port".to_string(),
                reason: "bad".to_string(),
            })
        });
        let supervisor = HostSupervisor::new(config(), deps, shutdown.clone()).with_reload(loader);
        let handle = tokio::spawn(supervisor.run());

        host.request_rebuild("test");
        wait_for_phase(&host, "rebuild_failed").await;
        assert!(matches!(host.phase(), HostPhase::Rebuilt { failure: Some(ref f) } if f.contains("reload")));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_rebuild_command_reports_stderr() {
        let host = HostSignals::new();
        let deps = BridgeDeps::new(host.clone(), Arc::new(MemoryStore::new()));
        let shutdown = CancellationToken::new();

        let mut cfg = config();
        cfg.security.project_root = std::env::temp_dir();
        cfg.host.rebuild_command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'error CS1002: ; expected' >&2; exit 1".to_string(),
        ];
        let handle = tokio::spawn(HostSupervisor::new(cfg, deps, shutdown.clone()).run());

        host.request_rebuild("test");
        wait_for_phase(&host, "rebuild_failed").await;
        assert!(host.last_failure().unwrap().contains("CS1002"));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_grace_returns_promptly() {
        let host = HostSignals::new();
        let deps = BridgeDeps::new(host.clone(), Arc::new(MemoryStore::new()));
        let shutdown = CancellationToken::new();

        let mut cfg = config();
        cfg.compilation.rebuild_grace_ms = 60_000;
        let handle = tokio::spawn(HostSupervisor::new(cfg, deps, shutdown.clone()).run());

        host.request_rebuild("test");
        wait_for_phase(&host, "rebuilding").await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor stopped during grace")
            .unwrap()
            .unwrap();
        assert!(host.is_rebuilding());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_interrupts_rebuild_command() {
        let host = HostSignals::new();
        let deps = BridgeDeps::new(host.clone(), Arc::new(MemoryStore::new()));
        let shutdown = CancellationToken::new();
        let project = tempfile::tempdir().unwrap();
        let marker = project.path().join("started");

        let mut cfg = config();
        cfg.security.project_root = project.path().to_path_buf();
        cfg.host.rebuild_command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "touch started; sleep 30".to_string(),
        ];
        let handle = tokio::spawn(HostSupervisor::new(cfg, deps, shutdown.clone()).run());

        host.request_rebuild("test");
        tokio::time::timeout(Duration::from_secs(10), async {
            while !marker.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor stopped during rebuild command")
            .unwrap()
            .unwrap();
        assert!(host.is_rebuilding());
    }
}
