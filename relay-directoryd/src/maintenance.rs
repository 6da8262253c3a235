use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::registry::Registry;

/// Eviction loop: drops expired records every `period` until cancelled
pub async fn run(registry: Arc<Registry>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately; nothing can have expired yet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = registry.evict().await {
                    tracing::error!("Failed to run eviction: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Maintenance task shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::test_support::{signed_service, test_registry};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_eviction() {
        let registry = Arc::new(test_registry());
        let fresh = signed_service(1);
        let mut stale = signed_service(2);
        stale.created_time = Utc::now() - chrono::Duration::hours(3);
        stale.last_checkin_time = Utc::now() - chrono::Duration::hours(2);
        registry.register(fresh.clone()).await.unwrap();
        registry.register(stale).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(registry.clone(), Duration::from_secs(900), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(901)).await;
        assert_eq!(registry.all(), vec![fresh]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        run(Arc::new(test_registry()), Duration::from_secs(1), cancel).await;
    }
}
