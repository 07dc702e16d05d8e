use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::terminal;
use tracing::{info, warn};

use pier::builtin::BuiltinCommands;
use pier::cli::{Cli, Command, ConnectArgs, RunArgs, ServeArgs};
use pier::client::{ConnectOptions, RemoteClient, Terminal};
use pier::command::{CommandRequest, Env};
use pier::local::run_local;
use pier::server::listen;
use pier::session::SessionConfig;
use pier::telemetry;
use pier_proto::{BannerSource, SharedBanner};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_guard = match telemetry::init(&cli.logging.to_config()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("pier: {err}");
            std::process::exit(2);
        }
    };

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("pier: {err:#}");
            1
        }
    };
    // process::exit skips destructors; flush buffered log lines first.
    drop(log_guard);
    std::process::exit(code);
}

async fn run(command: Command) -> Result<i32> {
    match command {
        Command::Serve(args) => serve(args).await,
        Command::Connect(args) => connect(args).await,
        Command::Run(args) => run_once(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<i32> {
    let config = SessionConfig {
        queue_capacity: args.queue,
        banner: args.banner.clone().map(BannerSource::text),
        env: std::env::vars().collect(),
        ..SessionConfig::default()
    };
    let handle = listen(args.listener_options(), Arc::new(BuiltinCommands::new()), config)
        .await
        .context("failed to start listener")?;
    eprintln!("pier: serving on {}", handle.url());

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    info!(active = handle.active_sessions(), "shutdown signal received");
    handle.close().await.context("listener shutdown failed")?;
    Ok(0)
}

/// Restores cooked mode however `connect` exits.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        match terminal::enable_raw_mode() {
            Ok(()) => Some(Self),
            Err(err) => {
                warn!(error = %err, "raw mode unavailable; continuing in cooked mode");
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

async fn connect(args: ConnectArgs) -> Result<i32> {
    let options = ConnectOptions::new(Terminal::stdio()).with_mode(args.mode);
    let handle = RemoteClient::connect(&args.url, options)
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    let _raw = RawModeGuard::enable();
    tokio::select! {
        result = handle.wait() => result.context("session ended with error")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(0)
}

async fn run_once(args: RunArgs) -> Result<i32> {
    let banner = args
        .banner
        .map(SharedBanner::text)
        .unwrap_or_else(SharedBanner::none);
    let env: Env = std::env::vars().collect();
    let request = CommandRequest::from_args(args.args, env);
    let code = run_local(
        Arc::new(BuiltinCommands::new()),
        request,
        tokio::io::stdin(),
        std::io::stdout(),
        std::io::stderr(),
        banner,
    )
    .await
    .context("local run failed")?;
    Ok(code)
}
