//! Momentum Runner - Multi-timeframe futures strategy agent
//!
//! 1. Loads the engine configuration (YAML + `MOMENTUM__*` overrides)
//! 2. Connects to the broker/feature bridge
//! 3. Watches bar closes and runs decision cycles
//! 4. Manages every open position until it exits
//! 5. Closes all positions on Ctrl-C

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use momentum_runner::gateway::spawn_bar_watcher;
use momentum_runner::{BridgeClient, Collaborators, EngineConfig, StrategyRunner};

/// Runner entry point
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = EngineConfig::default_path();
    let config = EngineConfig::load(path.as_deref())?;

    // Initialize logging
    let level: tracing::Level = config.runtime.log_level.parse()?;
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting Momentum Runner...");
    info!("Config path: {:?}", path);
    info!("Effective configuration:\n{}", config.to_yaml()?);

    let call_timeout = Duration::from_millis(config.runtime.call_timeout_ms);
    let bridge = Arc::new(BridgeClient::new(&config.runtime.bridge_url, call_timeout)?);
    let collaborators = Collaborators::from_single(bridge, call_timeout);

    let shutdown = CancellationToken::new();
    let tf = config.timeframes;
    let mut watched = vec![tf.entry, tf.volume];
    watched.dedup();
    let bars = spawn_bar_watcher(
        collaborators.market.clone(),
        watched,
        Duration::from_millis(config.runtime.bar_poll_ms),
        call_timeout,
        shutdown.clone(),
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let runner = StrategyRunner::new(config, collaborators);
    runner.run(bars, shutdown.clone()).await?;
    shutdown.cancel();

    info!("Momentum Runner stopped");
    Ok(())
}
