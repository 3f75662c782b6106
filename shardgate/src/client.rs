//! Per-client shard affinity tracking
//!
//! Each client connection gets a `ClientContext` recording which shards the
//! current logical request touched. The touch sets are double-buffered:
//! `new_request` swaps `current` into `previous` and starts a fresh `current`,
//! so write-concern and error aggregation for the last request can still read
//! the shards it used.
//!
//! Rotation assumes one in-flight operation per client id. Concurrent
//! operations on the same id must be serialized by the caller.
//!
//! Callers without a connection (internal tasks) use `ClientId::LOCAL`, which
//! resolves to a context bound to the current task via
//! [`ClientRegistry::scope_local`] instead of a registry entry.

use crate::error::{ErrorDocument, Result, RouterError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

tokio::task_local! {
    static LOCAL_CLIENT: Arc<ClientContext>;
}

/// Identity of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Sentinel for callers without a connection
    pub const LOCAL: ClientId = ClientId(0);

    /// Derive an id from the remote port of a connection
    pub fn from_remote_port(port: u16) -> Self {
        ClientId((port as u64) << 16)
    }

    pub fn is_local(&self) -> bool {
        self.0 == 0
    }
}

/// Two named shard sets with an explicit swap
#[derive(Debug, Default)]
struct TouchSets {
    current: HashSet<String>,
    previous: HashSet<String>,
}

impl TouchSets {
    fn rotate(&mut self) {
        std::mem::swap(&mut self.current, &mut self.previous);
        self.current.clear();
    }
}

#[derive(Debug, Default)]
struct ClientState {
    touched: TouchSets,
    remote: Option<String>,
    /// Unix seconds of the last request, 0 once disconnected
    last_access: i64,
    last_error: Option<ErrorDocument>,
}

/// Shard affinity state of one client
#[derive(Debug)]
pub struct ClientContext {
    id: ClientId,
    state: Mutex<ClientState>,
}

impl ClientContext {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            state: Mutex::new(ClientState {
                last_access: chrono::Utc::now().timestamp(),
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Record that the current request touched `shard`
    pub fn add_shard(&self, shard: &str) {
        self.state.lock().touched.current.insert(shard.to_string());
    }

    /// Start a new logical request from `remote`
    ///
    /// The first remote seen is pinned for the life of the context; a
    /// different one means the transport recycled the client id.
    pub fn new_request(&self, remote: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(remote) = remote {
            match &state.remote {
                None => state.remote = Some(remote.to_string()),
                Some(pinned) if pinned != remote => {
                    return Err(RouterError::ProtocolViolation(format!(
                        "remotes don't match old [{}] new [{}]",
                        pinned, remote
                    )));
                }
                Some(_) => {}
            }
        }

        state.last_access = chrono::Utc::now().timestamp();
        state.last_error = None;
        state.touched.rotate();
        Ok(())
    }

    /// Mark the context inactive; the registry removes it later
    pub fn disconnect(&self) {
        self.state.lock().last_access = 0;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().last_access != 0
    }

    pub fn last_access(&self) -> i64 {
        self.state.lock().last_access
    }

    pub fn remote(&self) -> Option<String> {
        self.state.lock().remote.clone()
    }

    /// Shards touched by the current request
    pub fn shards(&self) -> BTreeSet<String> {
        self.state.lock().touched.current.iter().cloned().collect()
    }

    /// Shards touched by the previous request
    pub fn previous_shards(&self) -> BTreeSet<String> {
        self.state.lock().touched.previous.iter().cloned().collect()
    }

    pub fn set_last_error(&self, err: ErrorDocument) {
        self.state.lock().last_error = Some(err);
    }

    pub fn last_error(&self) -> Option<ErrorDocument> {
        self.state.lock().last_error.clone()
    }
}

/// Registry of client contexts keyed by client id
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<ClientContext>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the context for `id`, creating it if `create` is set
    ///
    /// `ClientId::LOCAL` always resolves to the task-bound context.
    pub fn get(&self, id: ClientId, create: bool) -> Option<Arc<ClientContext>> {
        if id.is_local() {
            return Some(Self::local());
        }

        let mut clients = self.clients.lock();
        if let Some(ctx) = clients.get(&id) {
            return Some(Arc::clone(ctx));
        }
        if !create {
            return None;
        }
        debug!("Creating client context {:#x}", id.0);
        let ctx = Arc::new(ClientContext::new(id));
        clients.insert(id, Arc::clone(&ctx));
        Some(ctx)
    }

    /// Context bound to the current task, or a detached one outside a scope
    ///
    /// A detached context is fresh on every call; state written to it
    /// (touched shards, last error) is not visible to later calls.
    pub fn local() -> Arc<ClientContext> {
        LOCAL_CLIENT
            .try_with(Arc::clone)
            .unwrap_or_else(|_| Arc::new(ClientContext::new(ClientId::LOCAL)))
    }

    /// Run `fut` with a fresh connectionless client context bound to it
    pub async fn scope_local<F: Future>(fut: F) -> F::Output {
        LOCAL_CLIENT
            .scope(Arc::new(ClientContext::new(ClientId::LOCAL)), fut)
            .await
    }

    /// Destroy the context for `id`
    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientContext>> {
        self.clients.lock().remove(&id)
    }

    /// Remove every context marked inactive by `disconnect`
    pub fn reap_disconnected(&self) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, ctx| ctx.is_active());
        before - clients.len()
    }

    /// Remove contexts idle for longer than `max_idle`, and disconnected ones
    ///
    /// Transports that never report a disconnect rely on this to free a
    /// client id for the next connection that reuses it.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        self.reap_idle_at(Utc::now(), max_idle)
    }

    pub fn reap_idle_at(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let max_idle = i64::try_from(max_idle.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.timestamp().saturating_sub(max_idle);
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, ctx| {
            let last = ctx.last_access();
            last != 0 && last >= cutoff
        });
        before - clients.len()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_moves_current_to_previous() {
        let ctx = ClientContext::new(ClientId(1 << 16));
        ctx.add_shard("X");
        assert_eq!(ctx.shards().into_iter().collect::<Vec<_>>(), vec!["X"]);

        ctx.new_request(None).unwrap();
        assert!(ctx.shards().is_empty());
        assert_eq!(ctx.previous_shards().into_iter().collect::<Vec<_>>(), vec!["X"]);

        ctx.new_request(None).unwrap();
        assert!(ctx.previous_shards().is_empty());
    }

    #[test]
    fn test_remote_mismatch_is_protocol_violation() {
        let ctx = ClientContext::new(ClientId(7 << 16));
        ctx.new_request(Some("10.0.0.1:5000")).unwrap();
        ctx.add_shard("s1");

        let err = ctx.new_request(Some("10.0.0.2:5000")).unwrap_err();
        assert!(matches!(err, RouterError::ProtocolViolation(_)));
        // A rejected request does not rotate
        assert!(ctx.shards().contains("s1"));

        ctx.new_request(Some("10.0.0.1:5000")).unwrap();
        assert!(ctx.previous_shards().contains("s1"));
    }

    #[test]
    fn test_disconnect_and_reap() {
        let registry = ClientRegistry::new();
        let a = registry.get(ClientId::from_remote_port(5001), true).unwrap();
        let _b = registry.get(ClientId::from_remote_port(5002), true).unwrap();
        assert_eq!(registry.len(), 2);

        a.disconnect();
        assert!(!a.is_active());
        assert_eq!(a.last_access(), 0);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.reap_disconnected(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(ClientId::from_remote_port(5001), false).is_none());
    }

    #[test]
    fn test_get_without_create() {
        let registry = ClientRegistry::new();
        assert!(registry.get(ClientId(42), false).is_none());
        let ctx = registry.get(ClientId(42), true).unwrap();
        let again = registry.get(ClientId(42), false).unwrap();
        assert!(Arc::ptr_eq(&ctx, &again));
    }

    #[test]
    fn test_client_id_from_port() {
        assert_eq!(ClientId::from_remote_port(1).0, 1 << 16);
        assert!(ClientId::LOCAL.is_local());
        assert!(!ClientId::from_remote_port(1).is_local());
    }

    #[tokio::test]
    async fn test_local_context_is_task_bound() {
        let registry = Arc::new(ClientRegistry::new());
        let r = Arc::clone(&registry);
        ClientRegistry::scope_local(async move {
            let first = r.get(ClientId::LOCAL, true).unwrap();
            first.add_shard("s9");
            let second = r.get(ClientId::LOCAL, false).unwrap();
            assert!(Arc::ptr_eq(&first, &second));
            assert!(second.shards().contains("s9"));
        })
        .await;

        // Local contexts never land in the registry
        assert!(registry.is_empty());
    }

    #[test]
    fn test_idle_context_frees_port_for_new_host() {
        let registry = ClientRegistry::new();
        let id = ClientId::from_remote_port(5000);

        let first = registry.get(id, true).unwrap();
        first.new_request(Some("10.0.0.1:5000")).unwrap();

        // Still fresh: the port is pinned to the first host
        assert_eq!(registry.reap_idle(Duration::from_secs(60)), 0);
        let again = registry.get(id, true).unwrap();
        assert!(matches!(
            again.new_request(Some("10.0.0.2:5000")),
            Err(RouterError::ProtocolViolation(_))
        ));

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(registry.reap_idle_at(later, Duration::from_secs(60)), 1);
        assert!(registry.is_empty());

        let second = registry.get(id, true).unwrap();
        second.new_request(Some("10.0.0.2:5000")).unwrap();
        assert_eq!(second.remote().as_deref(), Some("10.0.0.2:5000"));
    }

    #[test]
    fn test_reap_idle_also_drops_disconnected() {
        let registry = ClientRegistry::new();
        let ctx = registry.get(ClientId::from_remote_port(7000), true).unwrap();
        ctx.disconnect();
        assert_eq!(registry.reap_idle(Duration::from_secs(3600)), 1);
    }
}
