use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sk_kernel::api;
use sk_kernel::config_io;
use sk_kernel::runtime::register_default_providers;
use sk_kernel::AppState;

#[derive(Parser)]
#[command(name = "skipperd", version, about = "Skipper browser-automation kernel")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "skipper.toml")]
    config: PathBuf,

    /// Override the bind address from the config.
    #[arg(long)]
    bind: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the kernel (default).
    Serve,
    /// Validate the config file and exit.
    ConfigValidate,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Version) => {
            println!("skipperd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Command::ConfigValidate) => {
            match config_io::load_config(&cli.config) {
                Ok(_) => {
                    println!("config ok: {}", cli.config.display());
                    Ok(())
                }
                Err(e) => {
                    eprintln!("config invalid: {e}");
                    std::process::exit(1);
                }
            }
        }
        None | Some(Command::Serve) => {
            init_tracing(cli.json_logs);
            serve(cli).await
        }
    }
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sk_kernel=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let mut config = config_io::load_config(&cli.config).context("loading config")?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    let bind = config.server.bind.clone();

    let state = AppState::build(config, cli.config.clone()).context("building kernel state")?;
    register_default_providers(&state);

    // Bridge lane: connects out to the local tool-execution server and
    // keeps reconnecting until shutdown.
    let shutdown = CancellationToken::new();
    let bridge_task = tokio::spawn(Arc::clone(&state.bridge).run(shutdown.clone()));

    let (_addr, api_task) = api::serve(state.clone(), &bind)
        .await
        .context("binding kernel api")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "skipperd up");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested; draining run loops");

    // Stop every session; loops observe the latch at their next
    // boundary and release `running` themselves.
    for session_id in state.runs.session_ids() {
        state.runs.stop(&session_id);
        state.bridge.abort_invokes_by_session(&session_id);
    }
    shutdown.cancel();
    api_task.abort();
    let _ = bridge_task.await;

    Ok(())
}
