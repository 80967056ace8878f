//! Client registry — every live tunnel, keyed by its public ID.
//!
//! One `RwLock` guards the map. `register` checks and inserts under a single
//! write-lock acquisition so two agents racing for the same explicit ID can't
//! both win. Callers get cloned [`Tunnel`] snapshots and never hold the lock
//! across an await on the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::envelope::Frame;
use crate::error::TunnelError;

/// Length of generated tunnel IDs.
pub const GENERATED_ID_LEN: usize = 8;

/// Longest explicit ID accepted (one DNS label).
const MAX_ID_LEN: usize = 63;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Write half of a live multiplexed session, plus the signal that tears it down.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: u64,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::Sender<Frame>, cancel: CancellationToken) -> Self {
        Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            cancel,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Queue a frame for the session's writer task.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::SessionClosed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::SessionClosed)
    }

    /// Ask the session's reader and writer to unwind.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One registered client.
#[derive(Clone, Debug)]
pub struct Tunnel {
    /// Public ID, filled in by [`Registry::register`].
    pub id: String,
    /// Advertised address for direct-proxy delivery.
    pub address: String,
    pub port: u16,
    pub domain: Option<String>,
    /// Present only for multiplexed tunnels.
    pub session: Option<SessionHandle>,
}

impl Tunnel {
    pub fn new(address: impl Into<String>, port: u16, domain: Option<String>) -> Self {
        Self {
            id: String::new(),
            address: address.into(),
            port,
            domain,
            session: None,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }

    pub fn mode(&self) -> &'static str {
        if self.session.is_some() {
            "multiplexed"
        } else {
            "direct"
        }
    }
}

/// Diagnostic view of a tunnel for `GET /tunnels`.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub mode: &'static str,
    pub address: String,
    pub port: u16,
    pub domain: Option<String>,
    pub idle_secs: u64,
}

struct Entry {
    tunnel: Tunnel,
    last_activity: Instant,
}

/// Concurrency-safe map of tunnel ID → tunnel state.
#[derive(Clone, Default)]
pub struct Registry {
    tunnels: Arc<RwLock<HashMap<String, Entry>>>,
}

/// Tear down whatever an evicted entry still owns.
fn close_entry(id: &str, entry: &Entry, reason: &str) {
    if let Some(session) = &entry.tunnel.session {
        session.close();
    }
    info!(tunnel_id = %id, mode = entry.tunnel.mode(), reason, "Tunnel removed");
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `tunnel` under `candidate`, or under a fresh ID when `candidate`
    /// is `None`. Returns the assigned ID, always lowercase.
    pub async fn register(
        &self,
        candidate: Option<&str>,
        mut tunnel: Tunnel,
    ) -> Result<String, TunnelError> {
        // Host names are case-insensitive, so IDs are stored lowercased.
        let candidate = match candidate {
            Some(id) if !is_valid_id(id) => return Err(TunnelError::InvalidId(id.to_string())),
            Some(id) => Some(id.to_ascii_lowercase()),
            None => None,
        };

        let mut tunnels = self.tunnels.write().await;
        let id = match candidate {
            Some(id) if tunnels.contains_key(&id) => {
                return Err(TunnelError::DuplicateId(id));
            }
            Some(id) => id,
            None => loop {
                let id = generate_id();
                if !tunnels.contains_key(&id) {
                    break id;
                }
            },
        };

        tunnel.id.clone_from(&id);
        info!(
            tunnel_id = %id,
            mode = tunnel.mode(),
            address = %tunnel.address,
            port = tunnel.port,
            total = tunnels.len() + 1,
            "Tunnel registered"
        );
        tunnels.insert(
            id.clone(),
            Entry {
                tunnel,
                last_activity: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Remove a tunnel and close its session, if any. Idempotent.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.tunnels.write().await.remove(id);
        match removed {
            Some(entry) => {
                close_entry(id, &entry, "closed");
                true
            }
            None => false,
        }
    }

    /// Remove `id` only while it is still owned by `session_id`.
    ///
    /// A terminating session uses this so it can't evict a newer registration
    /// that reused the ID after an explicit close.
    pub async fn remove_session(&self, id: &str, session_id: u64) -> bool {
        let mut tunnels = self.tunnels.write().await;
        let owned = tunnels.get(id).is_some_and(|entry| {
            entry
                .tunnel
                .session
                .as_ref()
                .is_some_and(|s| s.session_id() == session_id)
        });
        if !owned {
            return false;
        }
        if let Some(entry) = tunnels.remove(id) {
            close_entry(id, &entry, "session ended");
        }
        true
    }

    pub async fn lookup(&self, id: &str) -> Result<Tunnel, TunnelError> {
        self.tunnels
            .read()
            .await
            .get(id)
            .map(|entry| entry.tunnel.clone())
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))
    }

    /// Reset the idle clock for `id`.
    pub async fn touch(&self, id: &str) -> bool {
        match self.tunnels.write().await.get_mut(id) {
            Some(entry) => {
                entry.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Evict every tunnel idle for longer than `timeout`. Returns evicted IDs.
    ///
    /// Single write-lock pass so a concurrent `touch` can't slip in between
    /// the age check and the removal.
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut tunnels = self.tunnels.write().await;
        let expired: Vec<String> = tunnels
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_activity) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = tunnels.remove(id) {
                close_entry(id, &entry, "idle timeout");
            }
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), remaining = tunnels.len(), "Idle sweep");
        }
        expired
    }

    /// Remove every tunnel, closing live sessions. Returns how many there were.
    pub async fn drain(&self) -> usize {
        let drained: Vec<(String, Entry)> = self.tunnels.write().await.drain().collect();
        for (id, entry) in &drained {
            close_entry(id, entry, "relay shutdown");
        }
        drained.len()
    }

    pub async fn snapshot(&self) -> Vec<TunnelInfo> {
        let now = Instant::now();
        let tunnels = self.tunnels.read().await;
        let mut list: Vec<TunnelInfo> = tunnels
            .values()
            .map(|entry| TunnelInfo {
                id: entry.tunnel.id.clone(),
                mode: entry.tunnel.mode(),
                address: entry.tunnel.address.clone(),
                port: entry.tunnel.port,
                domain: entry.tunnel.domain.clone(),
                idle_secs: now.saturating_duration_since(entry.last_activity).as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }
}

/// Short random ID: leading hex digits of a v4 UUID.
pub fn generate_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(GENERATED_ID_LEN);
    id
}

/// An explicit ID becomes a subdomain, so it must be one DNS label.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('-')
        && !id.ends_with('-')
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn direct(port: u16) -> Tunnel {
        Tunnel::new("127.0.0.1", port, None)
    }

    fn session() -> (SessionHandle, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (SessionHandle::new(tx, CancellationToken::new()), rx)
    }

    #[tokio::test]
    async fn test_generated_ids_are_distinct() {
        let registry = Registry::new();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let id = registry.register(None, direct(9000)).await.unwrap();
            assert_eq!(id.len(), GENERATED_ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(id));
        }
        assert_eq!(registry.len().await, 200);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_mutation() {
        let registry = Registry::new();
        registry.register(Some("myapp"), direct(9000)).await.unwrap();

        let err = registry
            .register(Some("myapp"), direct(9999))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DuplicateId(ref id) if id == "myapp"));

        let tunnel = registry.lookup("myapp").await.unwrap();
        assert_eq!(tunnel.port, 9000);
        assert_eq!(tunnel.id, "myapp");
    }

    #[tokio::test]
    async fn test_concurrent_registration_of_same_id() {
        let registry = Registry::new();
        let mut handles = Vec::new();
        for port in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register(Some("contested"), direct(port)).await
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_explicit_ids() {
        let registry = Registry::new();
        let too_long = "x".repeat(64);
        for bad in ["-lead", "trail-", "has.dot", "under_score", too_long.as_str()] {
            let err = registry.register(Some(bad), direct(1)).await.unwrap_err();
            assert!(matches!(err, TunnelError::InvalidId(_)), "{bad}");
        }
        assert!(registry.is_empty().await);
        assert!(is_valid_id("my-app-2"));
    }

    #[tokio::test]
    async fn test_remove_then_lookup_is_not_found() {
        let registry = Registry::new();
        let id = registry.register(None, direct(9000)).await.unwrap();
        assert!(registry.remove(&id).await);
        assert!(matches!(
            registry.lookup(&id).await,
            Err(TunnelError::NotFound(_))
        ));
        // Idempotent.
        assert!(!registry.remove(&id).await);
        assert!(!registry.touch(&id).await);
    }

    #[tokio::test]
    async fn test_remove_closes_attached_session() {
        let registry = Registry::new();
        let (handle, _rx) = session();
        let id = registry
            .register(None, direct(0).with_session(handle.clone()))
            .await
            .unwrap();
        assert_eq!(registry.lookup(&id).await.unwrap().mode(), "multiplexed");

        registry.remove(&id).await;
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(Frame::Close).await,
            Err(TunnelError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_stale_session_cannot_remove_newer_registration() {
        let registry = Registry::new();
        let (old, _old_rx) = session();
        let (new, _new_rx) = session();

        registry
            .register(Some("app"), direct(0).with_session(old.clone()))
            .await
            .unwrap();
        registry.remove("app").await;
        registry
            .register(Some("app"), direct(0).with_session(new.clone()))
            .await
            .unwrap();

        assert!(!registry.remove_session("app", old.session_id()).await);
        assert!(registry.lookup("app").await.is_ok());
        assert!(registry.remove_session("app", new.session_id()).await);
        assert!(registry.lookup("app").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_idle_tunnels() {
        let registry = Registry::new();
        registry.register(Some("stale"), direct(1)).await.unwrap();
        registry.register(Some("busy"), direct(2)).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        registry.touch("busy").await;
        tokio::time::advance(Duration::from_secs(20)).await;

        let evicted = registry.sweep_idle(Duration::from_secs(60)).await;
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(registry.lookup("stale").await.is_err());
        assert!(registry.lookup("busy").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_idle_time() {
        let registry = Registry::new();
        registry.register(Some("b"), direct(2)).await.unwrap();
        registry.register(Some("a"), direct(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let list = registry.snapshot().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "a");
        assert_eq!(list[0].mode, "direct");
        assert_eq!(list[0].idle_secs, 5);
    }

    #[tokio::test]
    async fn test_drain_closes_everything() {
        let registry = Registry::new();
        let (handle, _rx) = session();
        registry.register(None, direct(1)).await.unwrap();
        registry
            .register(Some("live"), direct(0).with_session(handle.clone()))
            .await
            .unwrap();

        assert_eq!(registry.drain().await, 2);
        assert!(registry.is_empty().await);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_explicit_id_is_case_insensitive() {
        let registry = Registry::new();
        let id = registry.register(Some("MyApp"), direct(1)).await.unwrap();
        assert_eq!(id, "myapp");
        assert!(registry.lookup("myapp").await.is_ok());
        assert!(matches!(
            registry.register(Some("MYAPP"), direct(2)).await,
            Err(TunnelError::DuplicateId(_))
        ));
    }
}
