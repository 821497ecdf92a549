//! Error types for the gateway core.
//!
//! Variants are grouped by where a failure originates: the FIFO transport,
//! request correlation, caller timeouts, and the engine
//! process itself. Front ends only need [`GatewayError::is_node_inaccessible`]
//! and [`GatewayError::http_status`] to render them.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    // Transport errors
    #[error("Failed to open FIFO {path}: {message}")]
    FifoOpen {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to write command {id} to FIFO {path}: {message}")]
    FifoWrite {
        id: Uuid,
        path: PathBuf,
        message: String,
    },

    #[error("Failed to read from FIFO {path}: {source}")]
    FifoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Node communication is not running")]
    NotCommunicating,

    #[error("Node communication stopped before a result for {id} arrived")]
    Disconnected { id: Uuid },

    // Correlation errors
    #[error("Unknown command {id}: no result slot is registered")]
    UnknownCommand { id: Uuid },

    #[error("Command {id} is already registered")]
    AlreadyRegistered { id: Uuid },

    #[error("Command {id} does not accept further results")]
    NotResumable { id: Uuid },

    // Timeout errors
    #[error("No result for command {id} after {timeout:?}")]
    ResultTimeout { id: Uuid, timeout: Duration },

    #[error("Command {id} could not be submitted within {timeout:?}")]
    SubmitTimeout { id: Uuid, timeout: Duration },

    // Process errors
    #[error("Engine launch failed: {message}")]
    LaunchFailed { message: String },

    #[error("Invalid PID file {path}: {message}")]
    InvalidPidFile { path: PathBuf, message: String },

    #[error("Engine stopped permanently after {attempts} restart attempts")]
    PermanentlyStopped { attempts: u32 },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl GatewayError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        GatewayError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether front ends should report this as "node is inaccessible".
    ///
    /// Transport, timeout and process failures all mean the engine cannot
    /// currently answer. Correlation and configuration errors are caller bugs.
    pub fn is_node_inaccessible(&self) -> bool {
        matches!(
            self,
            GatewayError::FifoOpen { .. }
                | GatewayError::FifoWrite { .. }
                | GatewayError::FifoRead { .. }
                | GatewayError::NotCommunicating
                | GatewayError::Disconnected { .. }
                | GatewayError::ResultTimeout { .. }
                | GatewayError::SubmitTimeout { .. }
                | GatewayError::LaunchFailed { .. }
                | GatewayError::PermanentlyStopped { .. }
        )
    }

    /// HTTP status code used by the HTTP front end.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::ResultTimeout { .. } | GatewayError::SubmitTimeout { .. } => 504,
            e if e.is_node_inaccessible() => 503,
            GatewayError::UnknownCommand { .. }
            | GatewayError::AlreadyRegistered { .. }
            | GatewayError::NotResumable { .. } => 400,
            _ => 500,
        }
    }
}
