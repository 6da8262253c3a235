use std::sync::Arc;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use relay_directoryd::api;
use relay_directoryd::config::Config;
use relay_directoryd::coordinator::Coordinator;
use relay_directoryd::crypto::Authority;
use relay_directoryd::maintenance;
use relay_directoryd::registry::{snapshot, snapshot::SnapshotHandle, Registry};
use relay_directoryd::verifier::ExitPolicyVerifier;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay_directoryd=info"))
        )
        .init();

    tracing::info!("Starting relay-directoryd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/relay-directory/directoryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let authority = Arc::new(Authority::load_or_generate(&config.authority.signing_key_path)?);

    // Read the previous snapshot before the writer can replace it
    let persisted = snapshot::load(&config.registry.snapshot_path)?;
    let snapshots = SnapshotHandle::spawn(config.registry.snapshot_path.clone());

    let mut registry = Registry::new(config.registry.clone(), Arc::new(ExitPolicyVerifier))
        .with_snapshots(snapshots.clone());

    let replication_rx = if config.coordination.partners.is_empty() {
        tracing::info!("No coordination partners configured");
        None
    } else {
        let (tx, rx) = flume::unbounded();
        registry = registry.with_replication(tx);
        Some(rx)
    };
    let registry = Arc::new(registry);

    let total = persisted.len();
    let restored = registry.restore(persisted).await;
    tracing::info!("Restored {} of {} persisted records", restored, total);
    registry.persist().await?;

    let coordinator = Arc::new(Coordinator::new(
        authority.clone(),
        registry.clone(),
        &config.coordination.partners,
    )?);

    let cancel = CancellationToken::new();

    let worker_handles = match replication_rx {
        Some(rx) => {
            let workers = config.coordination.worker_count();
            tracing::info!(
                "Replicating to {} partners with {} workers",
                config.coordination.partners.len(),
                workers
            );
            coordinator.spawn_workers(rx, workers, cancel.clone())
        }
        None => Vec::new(),
    };

    let maintenance_handle = tokio::spawn(maintenance::run(
        registry.clone(),
        config.registry.eviction_period(),
        cancel.clone(),
    ));

    let app_state = api::routes::AppState {
        registry: registry.clone(),
        coordinator,
        authority,
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(maintenance_handle, server_handle);
    futures::future::join_all(worker_handles).await;

    if let Err(e) = registry.persist().await {
        tracing::error!("Failed to write final snapshot: {}", e);
    }

    if let Err(e) = snapshots.shutdown().await {
        tracing::error!("Failed to shutdown snapshot writer: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
