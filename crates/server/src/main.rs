mod bootstrap;
mod dispatch;
mod health;

use anyhow::Result;
use ichigo_core::config::{AppConfig, LoadOptions};
use ichigo_core::CancellationToken;
use ichigo_telegram::{PollingRunner, ReconnectPolicy};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::health::PollingFlag;

/// Buffered inbound messages between the polling runner and the dispatcher.
const INBOUND_CAPACITY: usize = 256;

fn init_logging(config: &AppConfig) {
    use ichigo_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let me = app.telegram.get_me().await?;
    tracing::info!(
        event_name = "system.server.bot_identity",
        bot_id = me.id,
        username = me.username.as_deref().unwrap_or_default(),
        "telegram bot identity confirmed"
    );

    let polling_flag = PollingFlag::default();
    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
        polling_flag.clone(),
    )
    .await?;

    let shutdown = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let runner = PollingRunner::new(
        app.telegram.clone(),
        app.access.clone(),
        ReconnectPolicy::default(),
        inbound_tx,
    );
    let polling = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            polling_flag.set(true);
            let result = runner.run(shutdown.clone()).await;
            polling_flag.set(false);
            // The daemon does not outlive its update source.
            shutdown.cancel();
            result
        })
    };
    tracing::info!(
        event_name = "system.server.started",
        models = app.dispatcher.sessions().catalog().aliases().count(),
        "ichigod started"
    );

    let dispatcher = tokio::spawn(app.dispatcher.run(inbound_rx, shutdown.clone()));
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        _ = shutdown.cancelled() => {}
    }
    tracing::info!(event_name = "system.server.stopping", "ichigod stopping");
    shutdown.cancel();

    dispatcher.await?;
    let polled = polling.await?;
    app.db_pool.close().await;

    if let Err(error) = polled {
        tracing::error!(
            event_name = "system.server.polling_failed",
            error = %error,
            "long polling gave up"
        );
        return Err(error.into());
    }
    Ok(())
}
