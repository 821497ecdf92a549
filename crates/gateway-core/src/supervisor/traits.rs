//! Seams between the supervisor and the things it drives.

use crate::error::Result;
use crate::node::Node;
use async_trait::async_trait;
use std::time::Duration;

/// Starts new engine processes.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Spawn one engine process.
    async fn launch(&self) -> Result<Box<dyn EngineProcess>>;
}

/// A running engine process.
#[async_trait]
pub trait EngineProcess: Send {
    /// OS process id.
    fn pid(&self) -> u32;

    /// Wait for the process to exit.
    ///
    /// Returns the exit code, or `None` if it was killed by a signal.
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Ask the process to exit, killing it after `grace`.
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// The FIFO session the supervisor restarts alongside the engine.
#[async_trait]
pub trait CommunicationLink: Send + Sync {
    async fn start_communication(&self) -> Result<()>;

    async fn stop_communication(&self);
}

#[async_trait]
impl CommunicationLink for Node {
    async fn start_communication(&self) -> Result<()> {
        Node::start_communication(self).await
    }

    async fn stop_communication(&self) {
        Node::stop_communication(self).await
    }
}
