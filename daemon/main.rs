// nrepl-daemon: standalone nREPL server around the reference evaluator
use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::bounded;
use nrepl_server::{LispEvaluator, Server, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "nrepl-daemon")]
#[command(about = "nREPL server over TCP and Unix sockets")]
struct Args {
    /// Port to listen on (0 = auto-assign); overrides NREPL_PORT
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to; overrides NREPL_HOST
    #[arg(long)]
    host: Option<String>,

    /// Also listen on this Unix socket path
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// Log every request, and enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// How long to keep retrying a bind while the address is in use
    #[arg(long)]
    start_timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(path) = args.unix_socket {
        config.unix_socket = Some(path);
    }
    if let Some(ms) = args.start_timeout_ms {
        config.start_timeout = Duration::from_millis(ms);
    }
    config.verbose |= args.verbose;

    let log_level = if config.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let address = config.address();
    let mut handle = Server::start(config, LispEvaluator)
        .with_context(|| format!("starting nREPL server on {}", address))?;

    // Editors and scripts read the port from stdout
    println!("nREPL server started on port {} on host {}", handle.port(), handle.local_addr().ip());

    let (stop_tx, stop_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing Ctrl-C handler")?;

    let _ = stop_rx.recv();
    info!("Shutdown signal received, stopping");
    handle.stop();
    Ok(())
}
