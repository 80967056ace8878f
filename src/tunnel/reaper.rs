//! Idle reaper — periodically evicts tunnels with no recent traffic.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::registry::Registry;

/// Spawn the sweep loop. Returns `None` when `idle_timeout` is zero, which
/// disables reaping entirely.
pub fn spawn(
    registry: Registry,
    idle_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if idle_timeout.is_zero() {
        info!("Idle reaper disabled");
        return None;
    }
    info!(
        idle_timeout_secs = idle_timeout.as_secs(),
        interval_secs = interval.as_secs(),
        "Idle reaper started"
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => break,
            }
            for id in registry.sweep_idle(idle_timeout).await {
                warn!(tunnel_id = %id, "Evicted idle tunnel");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::registry::Tunnel;

    #[tokio::test]
    async fn test_zero_timeout_disables_reaper() {
        let handle = spawn(
            Registry::new(),
            Duration::ZERO,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        assert!(handle.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tunnel_is_evicted_and_active_one_kept() {
        let registry = Registry::new();
        registry
            .register(Some("idle"), Tunnel::new("127.0.0.1", 9000, None))
            .await
            .unwrap();
        registry
            .register(Some("busy"), Tunnel::new("127.0.0.1", 9001, None))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn(
            registry.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            cancel.clone(),
        )
        .unwrap();

        for _ in 0..15 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            registry.touch("busy").await;
        }

        assert!(registry.lookup("idle").await.is_err());
        assert!(registry.lookup("busy").await.is_ok());

        cancel.cancel();
        handle.await.unwrap();
    }
}
