//! FIFO transport tasks.
//!
//! Two long-lived tasks per Node session:
//! - the **outbound** task owns the write side of the commands FIFO and
//!   drains the Node's command queue into it, one frame per command;
//! - the **inbound** task owns the read side of the results FIFO, decodes
//!   each line and delivers it to the correlation table.
//!
//! Each task has its own stop signal and exits on it without touching the
//! other. Failing to open a FIFO after the configured retries is fatal to
//! the task and reported on the failure channel.

use crate::config::NodeSettings;
use crate::correlation::CorrelationTable;
use crate::error::{GatewayError, Result};
use crate::protocol::{Command, CommandResult, MIN_FRAME_LEN};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a stopped task may take to exit before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Which FIFO a transport task owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Fatal error reported by a transport task before it exits.
#[derive(Debug)]
pub struct TransportFailure {
    pub direction: Direction,
    pub error: GatewayError,
}

/// A command waiting for the outbound task.
///
/// `accepted` fires when the task takes the command off the queue. If the
/// submitter has already given up, the command is dropped unwritten.
pub(crate) struct Submission {
    pub(crate) cmd: Command,
    pub(crate) accepted: oneshot::Sender<()>,
}

/// Shared queue receiver, held by whichever outbound task is running.
pub(crate) type CommandQueue = Arc<Mutex<mpsc::Receiver<Submission>>>;

/// Handle to a running transport task.
pub(crate) struct TransportHandle {
    direction: Direction,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Signal the task to stop and wait for it to exit.
    ///
    /// A task stuck in FIFO I/O past the grace period is aborted.
    pub(crate) async fn shutdown(mut self) {
        self.stop.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task)
            .await
            .is_err()
        {
            warn!(
                "{} transport did not stop within {:?}, aborting",
                self.direction, SHUTDOWN_GRACE
            );
            self.task.abort();
        }
    }
}

/// Spawn the task that writes queued commands to the commands FIFO.
pub(crate) fn spawn_outbound(
    settings: Arc<NodeSettings>,
    table: Arc<CorrelationTable>,
    queue: CommandQueue,
    failures: mpsc::UnboundedSender<TransportFailure>,
) -> TransportHandle {
    let stop = CancellationToken::new();
    let task = tokio::spawn(run_outbound(
        settings,
        table,
        queue,
        failures,
        stop.clone(),
    ));
    TransportHandle {
        direction: Direction::Outbound,
        stop,
        task,
    }
}

/// Spawn the task that reads results from the results FIFO.
pub(crate) fn spawn_inbound(
    settings: Arc<NodeSettings>,
    table: Arc<CorrelationTable>,
    failures: mpsc::UnboundedSender<TransportFailure>,
) -> TransportHandle {
    let stop = CancellationToken::new();
    let task = tokio::spawn(run_inbound(settings, table, failures, stop.clone()));
    TransportHandle {
        direction: Direction::Inbound,
        stop,
        task,
    }
}

/// Open a FIFO end, retrying with a fixed delay.
///
/// Returns `Ok(None)` if stopped while waiting between attempts.
async fn open_with_retry<T>(
    direction: Direction,
    path: &Path,
    settings: &NodeSettings,
    stop: &CancellationToken,
    open: impl Fn(&Path) -> std::io::Result<T>,
) -> Result<Option<T>> {
    let attempts = settings.open_retry_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if stop.is_cancelled() {
            return Ok(None);
        }
        match open(path) {
            Ok(end) => {
                debug!("{} FIFO {} opened on attempt {}", direction, path.display(), attempt);
                return Ok(Some(end));
            }
            Err(e) => {
                warn!(
                    "Failed to open {} FIFO {} (attempt {}/{}): {}",
                    direction,
                    path.display(),
                    attempt,
                    attempts,
                    e
                );
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = stop.cancelled() => return Ok(None),
                _ = tokio::time::sleep(settings.open_retry_delay()) => {}
            }
        }
    }

    Err(GatewayError::FifoOpen {
        path: path.to_path_buf(),
        message: format!("gave up after {} attempts", attempts),
        source: last_error,
    })
}

fn open_commands_fifo(path: &Path) -> std::io::Result<pipe::Sender> {
    pipe::OpenOptions::new().open_sender(path)
}

fn open_results_fifo(path: &Path) -> std::io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().open_receiver(path)
}

fn report(
    failures: &mpsc::UnboundedSender<TransportFailure>,
    direction: Direction,
    error: GatewayError,
) {
    error!("{} transport failed: {}", direction, error);
    // The Node may already have dropped the receiver during shutdown.
    let _ = failures.send(TransportFailure { direction, error });
}

async fn write_frame(writer: &mut pipe::Sender, cmd: &Command) -> std::io::Result<()> {
    writer.write_all(&cmd.encode()).await?;
    writer.flush().await
}

async fn run_outbound(
    settings: Arc<NodeSettings>,
    table: Arc<CorrelationTable>,
    queue: CommandQueue,
    failures: mpsc::UnboundedSender<TransportFailure>,
    stop: CancellationToken,
) {
    let path = settings.commands_fifo.clone();

    // A previous task may still be releasing the queue.
    let mut queue = tokio::select! {
        _ = stop.cancelled() => return,
        guard = queue.lock_owned() => guard,
    };

    let mut writer = match open_with_retry(
        Direction::Outbound,
        &path,
        &settings,
        &stop,
        open_commands_fifo,
    )
    .await
    {
        Ok(Some(writer)) => writer,
        Ok(None) => return,
        Err(e) => return report(&failures, Direction::Outbound, e),
    };
    info!("Outbound transport active on {}", path.display());

    loop {
        let Submission { cmd, accepted } = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            submission = queue.recv() => match submission {
                Some(submission) => submission,
                None => break,
            },
        };
        if accepted.send(()).is_err() {
            debug!("Skipping command {}: submitter gave up", cmd.id());
            continue;
        }

        match write_frame(&mut writer, &cmd).await {
            Ok(()) => debug!("Wrote command {} ({} tokens)", cmd.id(), cmd.body().len()),
            Err(e) => {
                warn!("Failed to write command {}: {}", cmd.id(), e);

                // No reply will ever come for this command, so answer it here.
                let failure = GatewayError::FifoWrite {
                    id: cmd.id(),
                    path: path.clone(),
                    message: e.to_string(),
                };
                if !table.deliver(cmd.id(), Err(failure)) {
                    debug!("Command {} has no waiting caller", cmd.id());
                }

                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(settings.write_failure_pause()) => {}
                }

                writer = match open_with_retry(
                    Direction::Outbound,
                    &path,
                    &settings,
                    &stop,
                    open_commands_fifo,
                )
                .await
                {
                    Ok(Some(writer)) => writer,
                    Ok(None) => break,
                    Err(e) => return report(&failures, Direction::Outbound, e),
                };
                info!("Reopened commands FIFO {}", path.display());
            }
        }
    }

    debug!("Outbound transport stopped");
}

/// Decode one complete line and hand it to the correlation table.
pub(crate) fn dispatch_line(table: &CorrelationTable, line: &str) {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    if trimmed.trim().is_empty() {
        return;
    }
    if trimmed.len() < MIN_FRAME_LEN {
        debug!("Discarding short line from engine: {:?}", trimmed);
        return;
    }

    let result = match CommandResult::parse(trimmed) {
        Ok(result) => result,
        Err(err) => {
            warn!("Discarding malformed result line ({}): {:?}", err, trimmed);
            return;
        }
    };

    let id = result.id;
    let code = result.code;
    if table.deliver(id, Ok(result)) {
        debug!("Delivered result {} (code {})", id, code);
    } else {
        info!(
            "No registration found for result {} (code {}); caller timed out or reply is unsolicited",
            id, code
        );
    }
}

async fn run_inbound(
    settings: Arc<NodeSettings>,
    table: Arc<CorrelationTable>,
    failures: mpsc::UnboundedSender<TransportFailure>,
    stop: CancellationToken,
) {
    let path = settings.results_fifo.clone();

    let receiver = match open_with_retry(
        Direction::Inbound,
        &path,
        &settings,
        &stop,
        open_results_fifo,
    )
    .await
    {
        Ok(Some(receiver)) => receiver,
        Ok(None) => return,
        Err(e) => return report(&failures, Direction::Inbound, e),
    };
    info!("Inbound transport active on {}", path.display());

    let mut reader = BufReader::new(receiver);
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                // No writer attached right now; the engine may be restarting.
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(settings.eof_poll_interval()) => {}
                }
            }
            Ok(_) if buf.last() != Some(&b'\n') => {
                // Partial line before end-of-stream; keep it until the rest arrives.
            }
            Ok(_) => {
                dispatch_line(&table, &String::from_utf8_lossy(&buf));
                buf.clear();
            }
            Err(e) => {
                warn!("Failed to read results FIFO {}: {}", path.display(), e);
                buf.clear();

                let receiver = match open_with_retry(
                    Direction::Inbound,
                    &path,
                    &settings,
                    &stop,
                    open_results_fifo,
                )
                .await
                {
                    Ok(Some(receiver)) => receiver,
                    Ok(None) => break,
                    Err(_) => {
                        return report(
                            &failures,
                            Direction::Inbound,
                            GatewayError::FifoRead { path, source: e },
                        )
                    }
                };
                reader = BufReader::new(receiver);
                info!("Reopened results FIFO {}", path.display());
            }
        }
    }

    debug!("Inbound transport stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_dispatch_line_delivers_registered_result() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        table.register(id).unwrap();

        dispatch_line(&table, &format!("{}\t200\t2\tUSD\tEUR\n", id));

        let result = table.wait(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.code, 200);
        assert_eq!(result.tokens, vec!["2", "USD", "EUR"]);
    }

    #[tokio::test]
    async fn test_dispatch_line_ignores_malformed_lines() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        table.register(id).unwrap();

        dispatch_line(&table, "\n");
        dispatch_line(&table, "   \r\n");
        dispatch_line(&table, "short\n");
        dispatch_line(&table, "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz\t200\n");
        dispatch_line(&table, &format!("{}\tnot-a-code\n", id));

        // None of the above filled the slot.
        assert!(table.deliver(id, Ok(CommandResult::new(id, 201, vec![]))));
        let result = table.wait(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.code, 201);
    }

    #[test]
    fn test_dispatch_line_without_registration_is_dropped() {
        let table = CorrelationTable::new();
        dispatch_line(&table, &format!("{}\t200\n", Uuid::new_v4()));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_open_with_retry_gives_up() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut settings = NodeSettings::new(
            temp_dir.path().join("missing-commands.fifo"),
            temp_dir.path().join("missing-results.fifo"),
        );
        settings.open_retry_attempts = 2;
        settings.open_retry_delay_ms = 1;

        let stop = CancellationToken::new();
        let err = open_with_retry(
            Direction::Outbound,
            &settings.commands_fifo,
            &settings,
            &stop,
            open_commands_fifo,
        )
        .await
        .unwrap_err();

        match err {
            GatewayError::FifoOpen { path, source, .. } => {
                assert_eq!(path, settings.commands_fifo);
                assert!(source.is_some());
            }
            other => panic!("Expected FifoOpen, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_with_retry_stops_when_cancelled() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let settings = NodeSettings::new(
            temp_dir.path().join("missing-commands.fifo"),
            temp_dir.path().join("missing-results.fifo"),
        );
        let stop = CancellationToken::new();
        stop.cancel();

        let opened = open_with_retry(
            Direction::Inbound,
            &settings.results_fifo,
            &settings,
            &stop,
            open_results_fifo,
        )
        .await
        .unwrap();
        assert!(opened.is_none());
    }
}
