//! fleetd deployment agent binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleetd_agent::client::ControllerClient;
use fleetd_agent::state::SqliteJournal;
use fleetd_agent::{build_environment, Agent, Config};
use fleetd_workflow::OperationBackend;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        system_id = %config.system_id,
        controller_url = %config.controller_url,
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        "Starting fleetd agent"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let journal = SqliteJournal::open(config.journal_path()).context("failed to open journal")?;
    let pending = journal.workflow_ids().context("failed to read journal")?;
    if !pending.is_empty() {
        info!(count = pending.len(), "Journal holds unfinished executions");
    }

    let client = ControllerClient::new(&config.controller_url, config.system_id.clone())
        .context("failed to build controller client")?;

    let scanner = match &config.scanner_url {
        Some(url) => {
            info!(scanner_url = %url, "Routing check-ip to address scanner");
            let scanner = ControllerClient::new(url, config.system_id.clone())
                .context("failed to build scanner client")?;
            Some(Arc::new(scanner) as Arc<dyn OperationBackend>)
        }
        None => None,
    };

    let env = build_environment(&config, Arc::new(client), scanner, Arc::new(journal));
    let agent = Arc::new(Agent::new(&config, env));
    agent.start().await.context("failed to start worker pool")?;

    // Initial configuration runs in the background; a failure leaves no
    // deploy workers until the next successful reconfiguration.
    tokio::spawn({
        let agent = Arc::clone(&agent);
        async move {
            match agent.configure(true).await {
                Ok(result) => info!(task_queues = ?result.task_queues, "Initial configuration complete"),
                Err(e) => error!(error = %e, "Initial configuration failed"),
            }
        }
    });

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Control surface listening");

    let server = tokio::spawn({
        let router = agent.router();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        fatal = agent.error() => {
            if let Some(e) = fatal {
                error!(error = %e, "Fatal worker error");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    agent.shutdown().await;

    match server.await {
        Ok(Ok(())) => info!("Control surface stopped"),
        Ok(Err(e)) => warn!(error = %e, "Control surface error"),
        Err(e) => warn!(error = %e, "Control surface task panicked"),
    }

    info!("Agent shutdown complete");
    Ok(())
}
