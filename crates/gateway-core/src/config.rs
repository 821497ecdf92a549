//! Configuration for the gateway.
//!
//! Compile-time defaults live in the constant-holding structs below. Runtime
//! settings are read from a JSON file into [`GatewaySettings`]; every field
//! there is optional and falls back to these defaults.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// FIFO transport timing.
pub struct TransportConfig;

impl TransportConfig {
    pub const OPEN_RETRY_ATTEMPTS: u32 = 5;
    pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);
    pub const WRITE_FAILURE_PAUSE: Duration = Duration::from_millis(200);
    pub const EOF_POLL_INTERVAL: Duration = Duration::from_millis(50);
    pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
    pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const RESULT_TIMEOUT: Duration = Duration::from_secs(20);
    pub const QUEUE_CAPACITY: usize = 1;
    pub const MAX_RESUMABLE_REPLIES: usize = 32;
}

/// Engine process supervision.
pub struct SupervisorConfig;

impl SupervisorConfig {
    pub const MAX_RESTART_ATTEMPTS: u32 = 3;
    pub const RESTART_RESET_WINDOW: Duration = Duration::from_secs(60);
    pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
}

/// Default file names, relative to the engine working directory.
pub struct PathsConfig;

impl PathsConfig {
    pub const COMMANDS_FIFO: &'static str = "fifo/commands.fifo";
    pub const RESULTS_FIFO: &'static str = "fifo/results.fifo";
    pub const PID_FILE: &'static str = "process.pid";
    pub const SETTINGS_FILE: &'static str = "conf.json";
}

fn ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Settings for one Node: FIFO locations and transport timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub commands_fifo: PathBuf,
    pub results_fifo: PathBuf,
    pub open_retry_attempts: u32,
    pub open_retry_delay_ms: u64,
    pub write_failure_pause_ms: u64,
    pub eof_poll_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub submit_timeout_ms: u64,
    pub result_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            commands_fifo: PathBuf::from(PathsConfig::COMMANDS_FIFO),
            results_fifo: PathBuf::from(PathsConfig::RESULTS_FIFO),
            open_retry_attempts: TransportConfig::OPEN_RETRY_ATTEMPTS,
            open_retry_delay_ms: ms(TransportConfig::OPEN_RETRY_DELAY),
            write_failure_pause_ms: ms(TransportConfig::WRITE_FAILURE_PAUSE),
            eof_poll_interval_ms: ms(TransportConfig::EOF_POLL_INTERVAL),
            settle_delay_ms: ms(TransportConfig::SETTLE_DELAY),
            submit_timeout_ms: ms(TransportConfig::SUBMIT_TIMEOUT),
            result_timeout_ms: ms(TransportConfig::RESULT_TIMEOUT),
            queue_capacity: TransportConfig::QUEUE_CAPACITY,
        }
    }
}

impl NodeSettings {
    /// Settings for FIFOs at the given paths, default timing.
    pub fn new(commands_fifo: impl Into<PathBuf>, results_fifo: impl Into<PathBuf>) -> Self {
        Self {
            commands_fifo: commands_fifo.into(),
            results_fifo: results_fifo.into(),
            ..Self::default()
        }
    }

    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_delay_ms)
    }

    pub fn write_failure_pause(&self) -> Duration {
        Duration::from_millis(self.write_failure_pause_ms)
    }

    pub fn eof_poll_interval(&self) -> Duration {
        Duration::from_millis(self.eof_poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    /// Resolve relative FIFO paths against `base`.
    pub fn resolve(mut self, base: &Path) -> Self {
        self.commands_fifo = resolve_path(base, &self.commands_fifo);
        self.results_fifo = resolve_path(base, &self.results_fifo);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.open_retry_attempts == 0 {
            return Err(GatewayError::Config {
                message: "open_retry_attempts must be at least 1".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(GatewayError::Config {
                message: "queue_capacity must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Settings for launching and supervising the engine executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub max_restart_attempts: u32,
    pub restart_reset_window_ms: u64,
    pub stop_grace_period_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./engine"),
            args: Vec::new(),
            working_dir: PathBuf::from("node"),
            pid_file: PathBuf::from(PathsConfig::PID_FILE),
            log_file: None,
            max_restart_attempts: SupervisorConfig::MAX_RESTART_ATTEMPTS,
            restart_reset_window_ms: ms(SupervisorConfig::RESTART_RESET_WINDOW),
            stop_grace_period_ms: ms(SupervisorConfig::STOP_GRACE_PERIOD),
        }
    }
}

impl EngineSettings {
    pub fn restart_reset_window(&self) -> Duration {
        Duration::from_millis(self.restart_reset_window_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    /// Absolute pid file path.
    pub fn pid_file_path(&self) -> PathBuf {
        resolve_path(&self.working_dir, &self.pid_file)
    }

    /// Absolute log file path, if logging to a file.
    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|p| resolve_path(&self.working_dir, p))
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub engine: EngineSettings,
    pub node: NodeSettings,
}

impl GatewaySettings {
    /// Load settings from a JSON file.
    ///
    /// A missing file yields the defaults. Relative working directories are
    /// resolved against the file's directory, and relative FIFO paths
    /// against the engine working directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| GatewayError::io_with_path(e, path))?;
            let settings: GatewaySettings =
                serde_json::from_str(&content).map_err(|e| GatewayError::Json {
                    message: format!("Failed to parse settings from {}: {}", path.display(), e),
                    source: Some(e),
                })?;
            info!("Loaded settings from {}", path.display());
            settings
        } else {
            debug!("No settings file at {}, using defaults", path.display());
            GatewaySettings::default()
        };

        settings.resolve(&base)
    }

    /// Resolve relative paths and validate values.
    pub fn resolve(mut self, base: &Path) -> Result<Self> {
        self.engine.working_dir = resolve_path(base, &self.engine.working_dir);
        self.node = self.node.resolve(&self.engine.working_dir);
        self.node.validate()?;
        Ok(self)
    }
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_constants() {
        let node = NodeSettings::default();
        assert_eq!(node.settle_delay(), TransportConfig::SETTLE_DELAY);
        assert_eq!(node.submit_timeout(), TransportConfig::SUBMIT_TIMEOUT);
        assert_eq!(node.queue_capacity, 1);

        let engine = EngineSettings::default();
        assert_eq!(
            engine.restart_reset_window(),
            SupervisorConfig::RESTART_RESET_WINDOW
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = GatewaySettings::load(temp_dir.path().join("conf.json")).unwrap();

        assert_eq!(settings.engine.working_dir, temp_dir.path().join("node"));
        assert_eq!(
            settings.node.commands_fifo,
            temp_dir.path().join("node").join("fifo/commands.fifo")
        );
        assert_eq!(
            settings.engine.pid_file_path(),
            temp_dir.path().join("node").join("process.pid")
        );
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf.json");
        std::fs::write(
            &path,
            r#"{"engine": {"executable": "/opt/engine/bin", "working_dir": "/opt/engine"},
                "node": {"settle_delay_ms": 250, "results_fifo": "/tmp/results.fifo"}}"#,
        )
        .unwrap();

        let settings = GatewaySettings::load(&path).unwrap();
        assert_eq!(settings.engine.executable, PathBuf::from("/opt/engine/bin"));
        assert_eq!(settings.engine.working_dir, PathBuf::from("/opt/engine"));
        assert_eq!(settings.node.settle_delay(), Duration::from_millis(250));
        assert_eq!(settings.node.results_fifo, PathBuf::from("/tmp/results.fifo"));
        assert_eq!(
            settings.node.commands_fifo,
            PathBuf::from("/opt/engine/fifo/commands.fifo")
        );
        assert_eq!(
            settings.engine.max_restart_attempts,
            SupervisorConfig::MAX_RESTART_ATTEMPTS
        );
    }

    #[test]
    fn test_load_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = GatewaySettings::load(&path).unwrap_err();
        assert!(matches!(err, GatewayError::Json { .. }));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf.json");
        std::fs::write(&path, r#"{"node": {"queue_capacity": 0}}"#).unwrap();

        let err = GatewaySettings::load(&path).unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
    }
}
