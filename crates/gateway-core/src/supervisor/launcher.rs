//! Launching the real engine executable.

use super::traits::{EngineLauncher, EngineProcess};
use crate::config::EngineSettings;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Spawns the engine executable described by [`EngineSettings`].
///
/// The engine runs in its own process group inside its working directory.
/// Its stdout and stderr go to the configured log file, or are discarded.
pub struct ProcessLauncher {
    settings: EngineSettings,
}

impl ProcessLauncher {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    /// Relative paths with a directory part (`./engine`, `bin/engine`) are
    /// taken relative to the working directory. Bare names go through PATH.
    fn executable(&self) -> PathBuf {
        let executable = &self.settings.executable;
        if executable.is_relative() && executable.components().count() > 1 {
            self.settings.working_dir.join(executable)
        } else {
            executable.clone()
        }
    }

    fn output(&self) -> Result<(Stdio, Stdio)> {
        match self.settings.log_file_path() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| GatewayError::io_with_path(e, parent))?;
                }
                let stdout = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| GatewayError::io_with_path(e, &path))?;
                let stderr = stdout
                    .try_clone()
                    .map_err(|e| GatewayError::io_with_path(e, &path))?;
                Ok((Stdio::from(stdout), Stdio::from(stderr)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<Box<dyn EngineProcess>> {
        let executable = self.executable();
        let (stdout, stderr) = self.output()?;

        let mut command = std::process::Command::new(&executable);
        command
            .args(&self.settings.args)
            .current_dir(&self.settings.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);

        let child = Command::from(command)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::LaunchFailed {
                message: format!("Failed to spawn {}: {}", executable.display(), e),
            })?;

        let pid = child.id().ok_or_else(|| GatewayError::LaunchFailed {
            message: format!("{} exited before its pid was read", executable.display()),
        })?;

        info!(
            "Launched engine {} (pid {}) in {}",
            executable.display(),
            pid,
            self.settings.working_dir.display()
        );
        Ok(Box::new(ChildProcess { child, pid }))
    }
}

/// An engine spawned by [`ProcessLauncher`].
pub struct ChildProcess {
    child: Child,
    pid: u32,
}

#[async_trait]
impl EngineProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        // The engine leads its own group; signal the whole group.
        let group = i32::try_from(self.pid).map(Pid::from_raw).map_err(|_| {
            GatewayError::LaunchFailed {
                message: format!("pid {} out of range", self.pid),
            }
        })?;
        debug!("Sending SIGTERM to engine group {}", group);
        match killpg(group, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to send SIGTERM to engine group {}: {}", group, e),
        }

        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            debug!("Engine {} exited after SIGTERM", self.pid);
            return Ok(());
        }

        warn!("Engine {} still running after {:?}, killing", self.pid, grace);
        self.child.kill().await?;
        Ok(())
    }
}
