use std::path::PathBuf;
use std::time::Duration;

use assistant_session::config::default_snapshot_path;
use assistant_session::{run_server, LaunchSpec, ServerConfig, SessionConfig, TransportKind};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "assistant-session")]
#[command(about = "Supervise an assistant subprocess and serve its turns over HTTP", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7593)]
    port: u16,

    /// Assistant executable speaking the stdio protocol.
    #[arg(long, default_value = "codex")]
    program: PathBuf,

    /// Repeatable; defaults to `app-server`.
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    #[arg(long, default_value = ".")]
    workspace_root: PathBuf,

    #[arg(long)]
    model: Option<String>,

    #[arg(long, default_value = "app-server")]
    transport: TransportKind,

    #[arg(long)]
    probe_program: Option<PathBuf>,

    #[arg(long = "probe-arg", allow_hyphen_values = true)]
    probe_args: Vec<String>,

    #[arg(long)]
    snapshot_path: Option<PathBuf>,

    #[arg(long)]
    proposal_dir: Option<PathBuf>,

    #[arg(long)]
    request_timeout_ms: Option<u64>,

    #[arg(long)]
    turn_start_timeout_ms: Option<u64>,

    #[arg(long)]
    probe_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "assistant-session failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();

    let cli = Cli::parse();
    let args = if cli.args.is_empty() {
        vec!["app-server".to_string()]
    } else {
        cli.args
    };

    let mut session = SessionConfig::new(LaunchSpec::new(cli.program).with_args(args), cli.workspace_root);
    session.model = cli.model;
    session.transport = cli.transport;
    session.probe = cli
        .probe_program
        .map(|program| LaunchSpec::new(program).with_args(cli.probe_args));
    session.snapshot_path = Some(cli.snapshot_path.unwrap_or_else(default_snapshot_path));
    session.proposal_dir = cli.proposal_dir;
    if let Some(ms) = cli.request_timeout_ms.filter(|ms| *ms > 0) {
        session.request_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.turn_start_timeout_ms.filter(|ms| *ms > 0) {
        session.turn_start_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.probe_timeout_ms.filter(|ms| *ms > 0) {
        session.probe_timeout = Duration::from_millis(ms);
    }

    run_server(ServerConfig {
        host: cli.host,
        port: cli.port,
        session,
    })
    .await
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}
