//! Engine process liveness and termination through its pid file.
//!
//! These helpers work on any pid recorded in a pid file, including an engine
//! started by another invocation of the gateway. They only signal the single
//! process named in the file, never a process group.

use crate::error::{GatewayError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval between liveness checks while waiting for a process to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read and validate the pid stored in `pid_file`.
///
/// Returns `Ok(None)` when the file does not exist. Content that is not a
/// positive pid is rejected, so a corrupt file can never make us signal a
/// process group (`0`, negative values) or every process (`-1`).
pub fn read_pid_file(pid_file: &Path) -> Result<Option<Pid>> {
    let content = match std::fs::read_to_string(pid_file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GatewayError::io_with_path(e, pid_file)),
    };

    let trimmed = content.trim();
    let raw: i32 = trimmed.parse().map_err(|_| GatewayError::InvalidPidFile {
        path: pid_file.to_path_buf(),
        message: format!("not a pid: {:?}", trimmed),
    })?;
    if raw <= 0 {
        return Err(GatewayError::InvalidPidFile {
            path: pid_file.to_path_buf(),
            message: format!("pid out of range: {}", raw),
        });
    }

    Ok(Some(Pid::from_raw(raw)))
}

/// Record `pid` in `pid_file`, creating parent directories as needed.
pub fn write_pid_file(pid_file: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GatewayError::io_with_path(e, parent))?;
    }
    std::fs::write(pid_file, format!("{}\n", pid))
        .map_err(|e| GatewayError::io_with_path(e, pid_file))?;
    debug!("Wrote pid {} to {}", pid, pid_file.display());
    Ok(())
}

/// Remove `pid_file` if it exists.
pub fn remove_pid_file(pid_file: &Path) -> Result<()> {
    match std::fs::remove_file(pid_file) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GatewayError::io_with_path(e, pid_file)),
    }
}

/// Check whether a process with the given pid exists.
///
/// `EPERM` means the process exists but belongs to someone else.
pub fn is_process_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Liveness probe for pid {} failed: {}", pid, e);
            false
        }
    }
}

/// Report whether the engine recorded in `pid_file` is running.
///
/// A missing pid file means the engine is not running. This is a
/// point-in-time probe; the answer may be stale as soon as it returns.
pub fn probe_engine(pid_file: &Path) -> Result<bool> {
    match read_pid_file(pid_file)? {
        Some(pid) => {
            let alive = is_process_alive(pid);
            debug!("Engine pid {} alive: {}", pid, alive);
            Ok(alive)
        }
        None => {
            debug!("No pid file at {}", pid_file.display());
            Ok(false)
        }
    }
}

/// Stop the engine recorded in `pid_file`.
///
/// Sends SIGTERM, waits up to `grace` for the process to exit, then sends
/// SIGKILL. The pid file is removed afterwards. Returns `true` if a running
/// process was stopped, `false` if none was running.
pub async fn stop_engine(pid_file: &Path, grace: Duration) -> Result<bool> {
    let pid = match read_pid_file(pid_file)? {
        Some(pid) => pid,
        None => return Ok(false),
    };

    if !is_process_alive(pid) {
        debug!("Engine pid {} is not running, removing stale pid file", pid);
        remove_pid_file(pid_file)?;
        return Ok(false);
    }

    info!("Sending SIGTERM to engine pid {}", pid);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            remove_pid_file(pid_file)?;
            return Ok(true);
        }
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    let iterations = (grace.as_millis() / STOP_POLL_INTERVAL.as_millis()).max(1);
    for _ in 0..iterations {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
        // Reap the zombie if the engine happens to be our child.
        let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            debug!("Engine pid {} exited after SIGTERM", pid);
            remove_pid_file(pid_file)?;
            return Ok(true);
        }
    }

    warn!("Engine pid {} still running after {:?}, sending SIGKILL", pid, grace);
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            return Err(GatewayError::Io {
                message: format!("Failed to kill engine pid {}: {}", pid, e),
                path: Some(pid_file.to_path_buf()),
                source: None,
            });
        }
    }

    tokio::time::sleep(STOP_POLL_INTERVAL).await;
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
    remove_pid_file(pid_file)?;
    Ok(true)
}
