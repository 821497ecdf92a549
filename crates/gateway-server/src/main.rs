//! Ledger Gateway - command-line and HTTP front end for the ledger engine.
//!
//! `start` launches the engine under a supervisor and serves HTTP until
//! Ctrl-C. `stop`, `status` and `exec` act on an engine that is already
//! running, located through its pid file. `exec` goes through the serving
//! gateway when there is one, since only one process may read the results
//! FIFO.

mod handler;
mod remote;
mod server;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gateway_core::config::PathsConfig;
use gateway_core::{
    ensure_fifo, probe_engine, stop_engine, Command, GatewaySettings, Node, Supervisor,
};
use handler::{CommandRequest, CommandResponse};
use server::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "ledger-gateway")]
#[command(about = "Gateway to a ledger engine driven over named pipes")]
struct Args {
    /// Settings file (missing file means defaults)
    #[arg(short, long, default_value = PathsConfig::SETTINGS_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the engine and serve HTTP until Ctrl-C
    Start {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },

    /// Stop a running engine
    Stop,

    /// Report whether the engine is running
    Status,

    /// Send one command to a running engine and print the reply
    Exec {
        /// Seconds to wait for each reply
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Keep reading replies until the engine marks the command complete
        #[arg(long)]
        resumable: bool,

        /// Command tokens
        #[arg(required = true)]
        tokens: Vec<String>,
    },
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let settings = GatewaySettings::load(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;

    match args.command {
        Commands::Start { host, port } => run_start(settings, &host, port).await,
        Commands::Stop => run_stop(settings).await,
        Commands::Status => run_status(settings),
        Commands::Exec {
            timeout_secs,
            resumable,
            tokens,
        } => run_exec(settings, timeout_secs, resumable, tokens).await,
    }
}

async fn run_start(settings: GatewaySettings, host: &str, port: u16) -> Result<()> {
    let pid_file = settings.engine.pid_file_path();
    if probe_engine(&pid_file)? {
        bail!(
            "Engine is already running (pid file {})",
            pid_file.display()
        );
    }

    ensure_fifo(&settings.node.commands_fifo)?;
    ensure_fifo(&settings.node.results_fifo)?;

    let node = Arc::new(Node::new(settings.node.clone()));
    let supervisor = Arc::new(Supervisor::for_node(&settings.engine, node.clone()));

    let pid = supervisor
        .start_communication()
        .await
        .context("Failed to start the engine")?;
    info!("Engine running with pid {}", pid);

    let mut states = supervisor.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!("Engine is {}", state);
        }
    });

    let state = Arc::new(AppState {
        node,
        supervisor: Some(supervisor.clone()),
    });
    let addr = server::start_server(state, host, port).await?;
    info!("Gateway running on {}", addr);

    let address_file = remote::address_file(&pid_file);
    if let Err(e) = remote::write_address(&address_file, addr) {
        warn!("exec will not find this gateway: {:#}", e);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping engine");
    remote::remove_address(&address_file);
    supervisor.stop().await?;

    Ok(())
}

async fn run_stop(settings: GatewaySettings) -> Result<()> {
    let pid_file = settings.engine.pid_file_path();
    if stop_engine(&pid_file, settings.engine.stop_grace_period()).await? {
        println!("Engine stopped");
    } else {
        println!("Engine is not running");
    }
    Ok(())
}

fn run_status(settings: GatewaySettings) -> Result<()> {
    let pid_file = settings.engine.pid_file_path();
    if probe_engine(&pid_file)? {
        println!("Engine is running");
    } else {
        println!("Engine is not running");
    }
    Ok(())
}

async fn run_exec(
    settings: GatewaySettings,
    timeout_secs: Option<u64>,
    resumable: bool,
    tokens: Vec<String>,
) -> Result<()> {
    let pid_file = settings.engine.pid_file_path();
    if !probe_engine(&pid_file)? {
        bail!("Node is inaccessible: engine is not running");
    }

    let request = CommandRequest {
        tokens,
        timeout_secs,
        resumable,
    };

    let address_file = remote::address_file(&pid_file);
    if let Some(addr) = remote::read_address(&address_file)? {
        match remote::forward_command(addr, &request).await {
            Err(e) if remote::is_unreachable(&e) => {
                warn!("No gateway answers at {} ({}), attaching directly", addr, e);
                remote::remove_address(&address_file);
            }
            outcome => return print_replies(outcome?),
        }
    }

    let replies = exec_direct(&settings, request).await?;
    print_replies(replies)
}

/// Run one command on a Node of our own. Only safe while no gateway holds
/// the FIFOs.
async fn exec_direct(
    settings: &GatewaySettings,
    request: CommandRequest,
) -> Result<Vec<CommandResponse>> {
    let cmd = if request.resumable {
        Command::resumable(request.tokens)
    } else {
        Command::new(request.tokens)
    };
    if let Err(index) = cmd.validate() {
        bail!("Token {} contains a tab or line break", index);
    }

    let timeout = request
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.node.result_timeout());
    let node = Node::new(settings.node.clone());
    node.start_communication().await?;

    let outcome = if cmd.is_resumable() {
        node.collect_resumable(&cmd, timeout).await
    } else {
        node.execute(&cmd, timeout).await.map(|result| vec![result])
    };
    node.stop_communication().await;

    match outcome {
        Ok(replies) => Ok(replies.into_iter().map(CommandResponse::from).collect()),
        Err(e) if e.is_node_inaccessible() => {
            warn!("Command {} failed: {}", cmd.id(), e);
            bail!("Node is inaccessible: {}", e);
        }
        Err(e) => Err(e.into()),
    }
}

fn print_replies(replies: Vec<CommandResponse>) -> Result<()> {
    for reply in replies {
        println!("{}\t{}", reply.code, reply.tokens.join("\t"));
    }
    Ok(())
}
