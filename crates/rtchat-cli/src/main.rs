mod cli;
mod commands;
mod theme;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rtchat_core::args::CommonArgs;
use rtchat_core::functions::FunctionRegistry;
use rtchat_core::logging::{self, LogConfig};
use rtchat_core::realtime::RealtimeClient;
use rtchat_core::{AppError, Config, ErrorPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(
    name = "rtchat",
    version,
    about = "Chat with a realtime conversational model from your terminal"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    theme::init_color(cli.common.no_color);

    let config_path = cli.common.config_path();
    let mut config =
        Config::load(config_path.as_deref()).context("failed to load configuration")?;
    cli.common.apply_overrides(&mut config);
    logging::init(LogConfig::for_settings(config.debug));
    config.validate().context("failed to load configuration")?;

    if config.debug {
        match config.info() {
            Ok(info) => debug!("Debug config: {info}"),
            Err(err) => debug!("Debug config unavailable: {err}"),
        }
    }

    let policy = ErrorPolicy::new(config.debug);
    let cancel = CancellationToken::new();
    let client = Arc::new(RealtimeClient::new(&config, FunctionRegistry::builtin()));
    spawn_signal_handlers(&cancel, &client);

    let outcome = cli::Repl::new(config, client.clone(), policy)
        .run(cancel.clone())
        .await;

    cancel.cancel();
    if let Err(err) = client.disconnect().await {
        policy.handle(&AppError::warning("failed to disconnect cleanly").with_cause(err));
    }
    if outcome.is_failure() {
        std::process::exit(1);
    }
    info!("CLI exited successfully.");
    Ok(())
}

fn spawn_signal_handlers(cancel: &CancellationToken, client: &Arc<RealtimeClient>) {
    {
        let cancel = cancel.clone();
        let client = client.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Interrupt received, shutting down");
                cancel.cancel();
                let _ = client.disconnect().await;
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let cancel = cancel.clone();
        let client = client.clone();
        tokio::spawn(async move {
            let Ok(mut terminate) = signal(SignalKind::terminate()) else {
                return;
            };
            if terminate.recv().await.is_some() {
                debug!("Termination requested, shutting down");
                cancel.cancel();
                let _ = client.disconnect().await;
            }
        });
    }
}
