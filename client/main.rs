// nrepl-eval: evaluate code against a running nREPL server
use anyhow::{bail, Context, Result};
use clap::Parser;
use nrepl_client::{Client, ClientConfig, Completion};
use nrepl_core::Status;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "nrepl-eval")]
#[command(about = "Evaluate code on an nREPL server and print the result")]
struct Args {
    /// Code to evaluate
    code: Option<String>,

    /// Evaluate the contents of this file (load-file) instead of CODE
    #[arg(short, long, conflicts_with = "code")]
    file: Option<PathBuf>,

    /// Server host; overrides NREPL_HOST
    #[arg(short = 'a', long)]
    host: Option<String>,

    /// Server port; overrides NREPL_PORT
    #[arg(short, long)]
    port: Option<u16>,

    /// Connect through a Unix socket instead of TCP
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// Evaluate in this session instead of the connection's default one
    #[arg(short, long)]
    session: Option<String>,

    /// Give up after this many milliseconds; overrides NREPL_TIMEOUT_MS
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Print every received message with a timestamp
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut config = ClientConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ms) = args.timeout_ms {
        config.request_timeout = Some(Duration::from_millis(ms));
    }
    config.verbose |= args.verbose;

    let log_level = if config.verbose { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let mut client = match &args.unix_socket {
        Some(path) => Client::connect_unix(path, config.clone())
            .with_context(|| format!("connecting to {}", path.display()))?,
        None => Client::connect(config.clone()).with_context(|| format!("connecting to {}", config.address()))?,
    };

    let session = args.session.as_deref();
    let pending = match (&args.code, &args.file) {
        (_, Some(path)) => {
            let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let name = path.file_name().and_then(|n| n.to_str());
            client.load_file(&contents, name, session)?
        }
        (Some(code), None) => client.eval(code, session)?,
        (None, None) => bail!("nothing to evaluate: pass CODE or --file"),
    };

    let completion = pending.wait();
    client.end();

    let failed = report(&completion);
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

// Print the response stream; returns whether evaluation failed
fn report(completion: &Completion) -> bool {
    for msg in completion.messages() {
        if let Some(out) = msg.get_str("out") {
            print!("{}", out);
        }
        if let Some(err) = msg.get_str("err") {
            eprint!("{}", err);
        }
    }
    match completion {
        Completion::Done(_) => {
            let status = completion.status();
            if let Some(value) = completion.value() {
                println!("{}", value);
            }
            if let Some(class) = completion.messages().iter().find_map(|m| m.get_str("ex")) {
                eprintln!("\n{}", class);
            }
            status.contains(&Status::Error) || status.contains(&Status::EvalError)
        }
        Completion::TimedOut(_) => {
            eprintln!("timed out waiting for a result");
            true
        }
        Completion::Disconnected(_) => {
            eprintln!("connection closed before a result arrived");
            true
        }
    }
}
