//! Node façade over the FIFO transport.
//!
//! A [`Node`] owns one command queue, one correlation table, and at most one
//! running pair of transport tasks. Callers submit with
//! [`Node::send_command`] and collect with [`Node::get_result`]; the slot for
//! a command is always registered before the command is queued, so a reply
//! can never arrive ahead of its registration.
//!
//! Submitting is a hand-off: `send_command` returns only once the outbound
//! task has taken the command off the queue. Stopping communication fails
//! anything still queued, so a restarted engine never sees a command whose
//! submitter already gave up. Outstanding registrations survive a restart;
//! their callers wait out their own timeouts.

use crate::config::{NodeSettings, TransportConfig};
use crate::correlation::CorrelationTable;
use crate::error::{GatewayError, Result};
use crate::protocol::{Command, CommandResult};
use crate::transport::{self, CommandQueue, Submission, TransportFailure, TransportHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transport tasks of one communication session.
struct Session {
    outbound: TransportHandle,
    inbound: TransportHandle,
    failure_watch: JoinHandle<()>,
}

impl Session {
    async fn shutdown(self) {
        self.outbound.shutdown().await;
        self.inbound.shutdown().await;
        self.failure_watch.abort();
    }
}

/// Client side of the engine's FIFO protocol.
pub struct Node {
    settings: Arc<NodeSettings>,
    table: Arc<CorrelationTable>,
    queue_tx: mpsc::Sender<Submission>,
    queue_rx: CommandQueue,
    session: Mutex<Option<Session>>,
    communicating: Arc<AtomicBool>,
}

impl Node {
    /// Create a node for the FIFOs in `settings`. No I/O happens until
    /// [`Node::start_communication`].
    pub fn new(settings: NodeSettings) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            settings: Arc::new(settings),
            table: Arc::new(CorrelationTable::new()),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            session: Mutex::new(None),
            communicating: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Whether both transport tasks are up and neither has failed.
    pub fn is_communicating(&self) -> bool {
        self.communicating.load(Ordering::SeqCst)
    }

    /// Number of commands still waiting for a result.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    /// Register a result slot for `cmd`, then hand it to the outbound task.
    ///
    /// Returns once the outbound task has taken the command. Fails with
    /// [`GatewayError::SubmitTimeout`] if that does not happen within the
    /// submit timeout, or [`GatewayError::NotCommunicating`] if communication
    /// stops first. Either way the registration is rolled back and the
    /// command is never written.
    pub async fn send_command(&self, cmd: &Command) -> Result<()> {
        let id = cmd.id();
        self.table.register(id)?;

        let timeout = self.settings.submit_timeout();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let submission = Submission {
            cmd: cmd.clone(),
            accepted: accepted_tx,
        };
        let handoff = async {
            self.queue_tx.send(submission).await.map_err(|_| ())?;
            accepted_rx.await.map_err(|_| ())
        };

        match tokio::time::timeout(timeout, handoff).await {
            Ok(Ok(())) => {
                debug!("Outbound transport took command {}", id);
                Ok(())
            }
            Ok(Err(())) => {
                self.table.unregister(id);
                warn!("Command {} was dropped from the queue", id);
                Err(GatewayError::NotCommunicating)
            }
            Err(_) => {
                self.table.unregister(id);
                warn!("Command {} was not taken within {:?}", id, timeout);
                Err(GatewayError::SubmitTimeout { id, timeout })
            }
        }
    }

    /// Wait for the result of a command submitted with
    /// [`Node::send_command`] or re-armed with [`Node::wait_command`].
    ///
    /// The registration is consumed whether a result arrives or not. After a
    /// timeout, a late reply is discarded; do not wait on the same id again.
    pub async fn get_result(&self, cmd: &Command, timeout: Duration) -> Result<CommandResult> {
        self.table.wait(cmd.id(), timeout).await
    }

    /// Re-arm the result slot of a resumable command that already received
    /// a reply, without sending it again.
    pub fn wait_command(&self, cmd: &Command) -> Result<()> {
        if !cmd.is_resumable() {
            return Err(GatewayError::NotResumable { id: cmd.id() });
        }
        self.table.register(cmd.id())
    }

    /// Send a command and wait for its result.
    pub async fn execute(&self, cmd: &Command, timeout: Duration) -> Result<CommandResult> {
        self.send_command(cmd).await?;
        self.get_result(cmd, timeout).await
    }

    /// Send a resumable command and collect replies until a terminal one.
    ///
    /// `timeout` applies to each reply. If a later reply times out, the
    /// replies received so far are returned.
    pub async fn collect_resumable(
        &self,
        cmd: &Command,
        timeout: Duration,
    ) -> Result<Vec<CommandResult>> {
        if !cmd.is_resumable() {
            return Err(GatewayError::NotResumable { id: cmd.id() });
        }

        self.send_command(cmd).await?;
        let mut replies = Vec::new();

        loop {
            let reply = match self.get_result(cmd, timeout).await {
                Ok(reply) => reply,
                Err(GatewayError::ResultTimeout { .. }) if !replies.is_empty() => {
                    warn!(
                        "Command {} stopped after {} replies without a final one",
                        cmd.id(),
                        replies.len()
                    );
                    break;
                }
                Err(e) => return Err(e),
            };

            let terminal = reply.is_terminal();
            replies.push(reply);
            if terminal {
                break;
            }
            if replies.len() >= TransportConfig::MAX_RESUMABLE_REPLIES {
                warn!(
                    "Command {} reached the reply cap of {}",
                    cmd.id(),
                    TransportConfig::MAX_RESUMABLE_REPLIES
                );
                break;
            }
            self.wait_command(cmd)?;
        }

        Ok(replies)
    }

    /// Start both transport tasks.
    ///
    /// Waits for the settle delay so the engine can attach to both FIFOs;
    /// a transport task that fails before then fails the start. Starting an
    /// already running node is a no-op; a session whose tasks have failed
    /// is torn down and replaced.
    pub async fn start_communication(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.take() {
            if self.is_communicating() {
                debug!("Node communication already running");
                *session = Some(current);
                return Ok(());
            }
            warn!("Replacing failed node communication session");
            current.shutdown().await;
        }

        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel::<TransportFailure>();
        let outbound = transport::spawn_outbound(
            self.settings.clone(),
            self.table.clone(),
            self.queue_rx.clone(),
            failures_tx.clone(),
        );
        let inbound =
            transport::spawn_inbound(self.settings.clone(), self.table.clone(), failures_tx);

        let settled = tokio::select! {
            Some(failure) = failures_rx.recv() => Err(failure),
            _ = tokio::time::sleep(self.settings.settle_delay()) => Ok(()),
        };

        if let Err(failure) = settled {
            outbound.shutdown().await;
            inbound.shutdown().await;
            error!("Node communication failed to start: {}", failure.error);
            return Err(failure.error);
        }

        self.communicating.store(true, Ordering::SeqCst);
        let communicating = self.communicating.clone();
        let failure_watch = tokio::spawn(async move {
            while let Some(failure) = failures_rx.recv().await {
                error!(
                    "{} transport stopped after a fatal error: {}",
                    failure.direction, failure.error
                );
                communicating.store(false, Ordering::SeqCst);
            }
        });

        *session = Some(Session {
            outbound,
            inbound,
            failure_watch,
        });
        info!(
            "Node communication established ({} / {})",
            self.settings.commands_fifo.display(),
            self.settings.results_fifo.display()
        );
        Ok(())
    }

    /// Stop both transport tasks and fail every command still queued.
    ///
    /// Registrations stay; their callers time out or are answered after a
    /// later start.
    pub async fn stop_communication(&self) {
        let session = self.session.lock().await.take();
        self.communicating.store(false, Ordering::SeqCst);

        if let Some(session) = session {
            session.shutdown().await;
            info!("Node communication stopped");
        }

        let mut queue = self.queue_rx.lock().await;
        let mut dropped = 0;
        while queue.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Dropped {} queued commands on stop", dropped);
        }
    }
}
