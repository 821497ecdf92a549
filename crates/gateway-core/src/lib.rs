//! Gateway Core - drives an external ledger engine over a pair of FIFOs.
//!
//! The engine reads tab-separated commands from one named pipe and writes
//! tab-separated results to another. This crate provides the client side:
//! a wire codec, a [`Node`] that correlates each result with the caller that
//! sent the command, and a [`Supervisor`] that keeps the engine process
//! alive. It has no HTTP or CLI layer; see the `gateway-server` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use gateway_core::{Command, GatewaySettings, Node};
//!
//! #[tokio::main]
//! async fn main() -> gateway_core::Result<()> {
//!     let settings = GatewaySettings::load("conf.json")?;
//!     let node = Node::new(settings.node.clone());
//!     node.start_communication().await?;
//!
//!     let cmd = Command::new(["GET:equivalents"]);
//!     let result = node.execute(&cmd, settings.node.result_timeout()).await?;
//!     println!("{} {:?}", result.code, result.tokens);
//!
//!     node.stop_communication().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod correlation;
pub mod error;
pub mod node;
pub mod platform;
pub mod protocol;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use config::{EngineSettings, GatewaySettings, NodeSettings, TransportConfig};
pub use correlation::CorrelationTable;
pub use error::{GatewayError, Result};
pub use node::Node;
pub use platform::{ensure_fifo, probe_engine, stop_engine};
pub use protocol::{Command, CommandKind, CommandResult, DecodeError};
pub use supervisor::{
    CommunicationLink, EngineLauncher, EngineProcess, ProcessLauncher, RestartBudget, Supervisor,
    SupervisorState,
};
pub use transport::{Direction, TransportFailure};
