//! Engine process supervision.
//!
//! The [`Supervisor`] launches the engine, records its pid, and runs a
//! monitor task that waits for the engine to exit. An exit that was not
//! requested through [`Supervisor::stop`] is a crash: the monitor stops the
//! Node's transport, relaunches the engine and re-establishes communication,
//! as long as the [`RestartBudget`] allows.
//!
//! Lifecycle changes are published as [`SupervisorState`] values on a
//! `watch` channel; see [`Supervisor::subscribe`].

mod budget;
mod launcher;
mod traits;

pub use budget::RestartBudget;
pub use launcher::{ChildProcess, ProcessLauncher};
pub use traits::{CommunicationLink, EngineLauncher, EngineProcess};

use crate::config::EngineSettings;
use crate::error::{GatewayError, Result};
use crate::node::Node;
use crate::platform;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the supervised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    Crashed,
    Restarting,
    /// The restart budget ran out. Terminal until the next `start`.
    PermanentlyStopped,
    /// Stopped through [`Supervisor::stop`].
    DeliberatelyStopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::NotStarted => "not started",
            SupervisorState::Running => "running",
            SupervisorState::Crashed => "crashed",
            SupervisorState::Restarting => "restarting",
            SupervisorState::PermanentlyStopped => "permanently stopped",
            SupervisorState::DeliberatelyStopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Monitor task of the current engine.
struct Monitor {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything the monitor task needs, cloned out of the supervisor.
#[derive(Clone)]
struct MonitorContext {
    launcher: Arc<dyn EngineLauncher>,
    link: Arc<dyn CommunicationLink>,
    state: Arc<watch::Sender<SupervisorState>>,
    deliberate: Arc<AtomicBool>,
    pid_file: PathBuf,
    grace: Duration,
    max_attempts: u32,
    reset_window: Duration,
}

impl MonitorContext {
    fn publish(&self, state: SupervisorState) {
        debug!("Supervisor state: {}", state);
        self.state.send_replace(state);
    }

    fn record_pid(&self, pid: u32) {
        if let Err(e) = platform::write_pid_file(&self.pid_file, pid) {
            warn!("Failed to record engine pid {}: {}", pid, e);
        }
    }

    fn clear_pid(&self) {
        if let Err(e) = platform::remove_pid_file(&self.pid_file) {
            warn!("Failed to remove pid file: {}", e);
        }
    }
}

/// Launches the engine and restarts it after crashes.
pub struct Supervisor {
    ctx: MonitorContext,
    monitor: Mutex<Option<Monitor>>,
}

impl Supervisor {
    pub fn new(
        settings: &EngineSettings,
        launcher: Arc<dyn EngineLauncher>,
        link: Arc<dyn CommunicationLink>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::NotStarted);
        Self {
            ctx: MonitorContext {
                launcher,
                link,
                state: Arc::new(state),
                deliberate: Arc::new(AtomicBool::new(false)),
                pid_file: settings.pid_file_path(),
                grace: settings.stop_grace_period(),
                max_attempts: settings.max_restart_attempts,
                reset_window: settings.restart_reset_window(),
            },
            monitor: Mutex::new(None),
        }
    }

    /// Supervise the real engine executable and restart `node` with it.
    pub fn for_node(settings: &EngineSettings, node: Arc<Node>) -> Self {
        Self::new(
            settings,
            Arc::new(ProcessLauncher::new(settings.clone())),
            node,
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        *self.ctx.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.ctx.state.subscribe()
    }

    /// Fail unless the engine is running or being restarted.
    pub fn ensure_available(&self) -> Result<()> {
        match self.state() {
            SupervisorState::Running
            | SupervisorState::Crashed
            | SupervisorState::Restarting => Ok(()),
            SupervisorState::PermanentlyStopped => Err(GatewayError::PermanentlyStopped {
                attempts: self.ctx.max_attempts,
            }),
            SupervisorState::NotStarted | SupervisorState::DeliberatelyStopped => {
                Err(GatewayError::NotCommunicating)
            }
        }
    }

    /// Launch the engine, record its pid and start monitoring it.
    ///
    /// Returns the engine pid. Fails if the engine is already supervised.
    pub async fn start(&self) -> Result<u32> {
        let mut monitor = self.monitor.lock().await;
        if let Some(current) = monitor.as_ref() {
            if !current.task.is_finished() {
                return Err(GatewayError::LaunchFailed {
                    message: "engine is already running under this supervisor".to_string(),
                });
            }
        }

        self.ctx.deliberate.store(false, Ordering::SeqCst);
        let process = self.ctx.launcher.launch().await?;
        let pid = process.pid();
        self.ctx.record_pid(pid);
        self.ctx.publish(SupervisorState::Running);

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_monitor(self.ctx.clone(), process, stop.clone()));
        *monitor = Some(Monitor { stop, task });

        Ok(pid)
    }

    /// Launch the engine and open the FIFO session to it.
    pub async fn start_communication(&self) -> Result<u32> {
        let pid = self.start().await?;
        self.ctx.link.start_communication().await?;
        Ok(pid)
    }

    /// Stop the engine on purpose. It is not restarted.
    pub async fn stop(&self) -> Result<()> {
        self.ctx.deliberate.store(true, Ordering::SeqCst);

        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            monitor.stop.cancel();
            let deadline = self.ctx.grace + Duration::from_secs(1);
            let mut task = monitor.task;
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                warn!("Engine monitor did not exit within {:?}, aborting", deadline);
                task.abort();
            }
        }

        self.ctx.link.stop_communication().await;
        self.ctx.clear_pid();
        if self.state() != SupervisorState::PermanentlyStopped {
            self.ctx.publish(SupervisorState::DeliberatelyStopped);
        }
        info!("Engine stopped");
        Ok(())
    }
}

enum Exit {
    Requested,
    Exited(Result<Option<i32>>),
}

async fn wait_exit(process: &mut dyn EngineProcess, stop: &CancellationToken) -> Exit {
    tokio::select! {
        biased;
        _ = stop.cancelled() => Exit::Requested,
        status = process.wait() => Exit::Exited(status),
    }
}

async fn run_monitor(
    ctx: MonitorContext,
    mut process: Box<dyn EngineProcess>,
    stop: CancellationToken,
) {
    let mut budget = RestartBudget::new(ctx.max_attempts, ctx.reset_window);

    loop {
        match wait_exit(process.as_mut(), &stop).await {
            Exit::Requested => {
                if let Err(e) = process.terminate(ctx.grace).await {
                    warn!("Failed to terminate engine {}: {}", process.pid(), e);
                }
                return;
            }
            Exit::Exited(status) => {
                if ctx.deliberate.load(Ordering::SeqCst) {
                    debug!("Engine {} exited after a stop request", process.pid());
                    return;
                }
                match status {
                    Ok(code) => {
                        warn!("Engine {} exited unexpectedly (code {:?})", process.pid(), code)
                    }
                    Err(e) => warn!("Lost track of engine {}: {}", process.pid(), e),
                }
                ctx.publish(SupervisorState::Crashed);
            }
        }

        process = match restart(&ctx, &mut budget, &stop).await {
            Some(process) => process,
            None => return,
        };
    }
}

/// Relaunch the engine until it is up with communication established.
///
/// Returns `None` when the budget is exhausted or a stop was requested.
async fn restart(
    ctx: &MonitorContext,
    budget: &mut RestartBudget,
    stop: &CancellationToken,
) -> Option<Box<dyn EngineProcess>> {
    loop {
        if stop.is_cancelled() {
            return None;
        }

        if !budget.try_acquire(Instant::now()) {
            error!(
                "Engine crashed {} times within {:?}, giving up",
                budget.max_attempts(),
                ctx.reset_window
            );
            ctx.link.stop_communication().await;
            ctx.clear_pid();
            ctx.publish(SupervisorState::PermanentlyStopped);
            return None;
        }

        ctx.publish(SupervisorState::Restarting);
        info!(
            "Restarting engine (attempt {}/{})",
            budget.attempts(),
            budget.max_attempts()
        );
        ctx.link.stop_communication().await;

        let mut process = match ctx.launcher.launch().await {
            Ok(process) => process,
            Err(e) => {
                warn!("Engine relaunch failed: {}", e);
                ctx.publish(SupervisorState::Crashed);
                continue;
            }
        };
        ctx.record_pid(process.pid());

        if stop.is_cancelled() {
            if let Err(e) = process.terminate(ctx.grace).await {
                warn!("Failed to terminate engine {}: {}", process.pid(), e);
            }
            return None;
        }

        match ctx.link.start_communication().await {
            Ok(()) => {
                ctx.publish(SupervisorState::Running);
                info!("Engine {} restarted", process.pid());
                return Some(process);
            }
            Err(e) => {
                warn!("Communication with restarted engine failed: {}", e);
                if let Err(e) = process.terminate(ctx.grace).await {
                    warn!("Failed to terminate engine {}: {}", process.pid(), e);
                }
                ctx.publish(SupervisorState::Crashed);
            }
        }
    }
}
