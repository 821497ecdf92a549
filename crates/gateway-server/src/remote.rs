//! Forwarding commands to a gateway that already owns the node FIFOs.
//!
//! Only one reader may sit on the results FIFO, so `exec` must not open a
//! second Node while `start` is serving. `start` records its HTTP address
//! next to the engine pid file; `exec` sends its command there instead.

use crate::handler::{CommandRequest, CommandResponse, ErrorBody, ResumableResponse};
use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the address file, placed beside the engine pid file.
pub const ADDRESS_FILE: &str = "gateway.addr";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a gateway serving the engine behind `pid_file` records its address.
pub fn address_file(pid_file: &Path) -> PathBuf {
    pid_file.with_file_name(ADDRESS_FILE)
}

/// Record the address a local client should use to reach this gateway.
pub fn write_address(path: &Path, mut addr: SocketAddr) -> Result<()> {
    if addr.ip().is_unspecified() {
        let loopback: IpAddr = if addr.is_ipv4() {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv6Addr::LOCALHOST.into()
        };
        addr.set_ip(loopback);
    }

    std::fs::write(path, addr.to_string())
        .with_context(|| format!("Failed to write gateway address to {}", path.display()))
}

/// Read a recorded gateway address. A missing file means no gateway.
pub fn read_address(path: &Path) -> Result<Option<SocketAddr>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let addr = content
        .trim()
        .parse()
        .with_context(|| format!("Invalid gateway address in {}", path.display()))?;
    Ok(Some(addr))
}

pub fn remove_address(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed gateway address file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Whether `err` means nothing is listening at the recorded address.
pub fn is_unreachable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .is_some_and(|e| e.is_connect())
}

/// Run `request` on the gateway at `addr` and return its replies.
pub async fn forward_command(
    addr: SocketAddr,
    request: &CommandRequest,
) -> Result<Vec<CommandResponse>> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;
    let url = format!("http://{}/api/v1/node/command", addr);
    debug!("Forwarding command to {}", url);

    let response = client.post(&url).json(request).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body: ErrorBody = response
            .json()
            .await
            .with_context(|| format!("Gateway answered {} without an error body", status))?;
        bail!("{}", body.error);
    }

    if request.resumable {
        let body: ResumableResponse = response.json().await?;
        Ok(body.replies)
    } else {
        let body: CommandResponse = response.json().await?;
        Ok(vec![body])
    }
}
