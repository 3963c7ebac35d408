// SPDX-License-Identifier: MIT

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

use agentd::config::GatewayConfig;
use agentd::router::provider::{EchoProvider, ModelProvider};
use agentd::{gateway, GatewayContext};

#[derive(Parser)]
#[command(
    name = "agentd",
    about = "Agent Gateway — always-on multi-tenant runtime daemon for sandboxed AI agents",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Bind address for the control plane (health endpoint binds port+1)
    #[arg(long, env = "AGENTD_HOST")]
    host: Option<String>,

    /// Control-plane WebSocket port
    #[arg(long, env = "AGENTD_PORT")]
    port: Option<u16>,

    /// Data directory for config, SQLite database, and audit log
    #[arg(long, env = "AGENTD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AGENTD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "AGENTD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon in the foreground (default when no subcommand given).
    Serve,
    /// Validate the resolved configuration and exit.
    ///
    /// Exit code 0 when the configuration is usable, 2 otherwise.
    CheckConfig,
}

fn init_logging(filter: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path.file_name().map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "agentd.log".into());
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = GatewayConfig::new(args.host, args.port, args.data_dir, args.log);
    let _log_guard = init_logging(&config.log, args.log_file.as_deref());

    if let Err(problems) = config.validate() {
        for p in &problems {
            error!("config: {p}");
            eprintln!("config: {p}");
        }
        std::process::exit(2);
    }

    if matches!(args.command, Some(Command::CheckConfig)) {
        println!("configuration OK");
        return;
    }

    // Fatal in production hardening mode: weak secrets, plaintext stores.
    if let Err(problems) = config.enforce_hardening() {
        for p in &problems {
            error!("hardening: {p}");
            eprintln!("hardening: {p}");
        }
        std::process::exit(1);
    }

    // Model vendors plug in here; the loopback provider keeps dev and test
    // deployments fully functional without any vendor credentials.
    let providers: Vec<Arc<dyn ModelProvider>> =
        vec![Arc::new(EchoProvider::new("echo", &["m1", "m1-mini"]))];

    let ctx = match GatewayContext::bootstrap(config, providers).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(err = %e, "startup failed");
            eprintln!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    if ctx.router.provider_count().await == 0 {
        error!("no providers available after startup");
        eprintln!("no providers available after startup");
        std::process::exit(1);
    }

    let health_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = gateway::health::run(health_ctx).await {
            error!(err = %e, "health endpoint failed");
        }
    });

    info!(version = env!("CARGO_PKG_VERSION"), "agentd starting");
    if let Err(e) = gateway::run(ctx).await {
        error!(err = %e, "gateway failed");
        std::process::exit(1);
    }
}
