mod adapters;
mod amount;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod settlement;
mod tips;
mod withdrawals;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;
use crate::settlement::{ShutdownOutcome, SubscriptionRunner};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,settlement_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting settlement worker");

    // Load configuration; invalid values stop the process here
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let worker = bootstrap::initialize_worker(&config)
        .await
        .context("failed to initialize worker")?;

    let runner = match worker.subscription.clone() {
        Some(runner_config) => Some(
            SubscriptionRunner::start(
                worker.adapter.clone(),
                worker.tips.clone(),
                worker.ledger.clone(),
                worker.clock.clone(),
                runner_config,
                None,
            )
            .await
            .context("failed to start settlement subscription")?,
        ),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let outcome = worker.runtime.run(shutdown_rx).await;

    if let Some(runner) = runner {
        let stats = runner.close().await;
        info!(credited = stats.credited, dropped = stats.dropped, "Subscription runner drained");
    }

    match outcome {
        ShutdownOutcome::Drained => info!("Settlement worker stopped cleanly"),
        ShutdownOutcome::TimedOut => {
            warn!("Settlement worker stopped with work possibly in flight");
        }
    }

    std::process::exit(outcome.exit_code());
}
