//! Tunnel manager - owns the registry and the pending-request table.
//!
//! Every routing decision goes through one [`TunnelManager`]. It is cheap to
//! clone (all state behind an `Arc`) and is handed to the HTTP router and to
//! each control-channel handler at startup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::connection::{ChannelId, TunnelConnection};
use super::pending::{PendingRequests, TunnelResponse};
use super::protocol::{ProtocolMessage, RequestFrame, ResponseFrame};
use super::registry::{RegisterError, Registry, SubdomainPolicy, TunnelInfo};

#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub subdomain_policy: SubdomainPolicy,
    /// Pending requests older than this are failed with 504. `None` disables expiry.
    pub request_timeout: Option<Duration>,
}

/// A change to the set of registered tunnels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    Registered { subdomain: String },
    Removed { subdomains: Vec<String> },
}

/// Observer notified synchronously after every registry change.
pub trait TopologyListener: Send + Sync {
    fn on_topology_change(&self, event: &TopologyEvent);
}

impl<F> TopologyListener for F
where
    F: Fn(&TopologyEvent) + Send + Sync,
{
    fn on_topology_change(&self, event: &TopologyEvent) {
        self(event);
    }
}

/// A public request to hand to an agent.
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    pub method: String,
    /// Path plus query string.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no tunnel registered for '{0}'")]
pub struct NoTunnel(pub String);

/// Handle to a forwarded request's eventual response.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<TunnelResponse>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the terminal response. Resolves exactly once.
    pub async fn wait(self) -> TunnelResponse {
        self.rx
            .await
            .unwrap_or_else(|_| TunnelResponse::synthetic(502, "Tunnel closed before responding"))
    }
}

/// Read-only snapshot for dashboards and `/api/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStats {
    pub total_tunnels: u64,
    pub active_tunnels: usize,
    pub pending_requests: usize,
    /// Seconds since the manager was created.
    pub uptime: u64,
    pub tunnels: Vec<TunnelInfo>,
}

struct Inner {
    registry: Registry,
    pending: PendingRequests,
    listeners: StdRwLock<Vec<Arc<dyn TopologyListener>>>,
    settings: ManagerSettings,
    next_channel: AtomicU64,
    started_at: Instant,
}

#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Registry::new(),
                pending: PendingRequests::new(),
                listeners: StdRwLock::new(Vec::new()),
                settings,
                next_channel: AtomicU64::new(1),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Mint a handle for a newly accepted control channel.
    pub fn open_channel(&self) -> ChannelId {
        ChannelId(self.inner.next_channel.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a topology listener. Listeners run on the caller's task, after the
    /// registry lock is released, and must not block.
    pub fn subscribe(&self, listener: Arc<dyn TopologyListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn notify(&self, event: &TopologyEvent) {
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_topology_change(event);
        }
    }

    // ─── Registry ────────────────────────────────────────────────────────────

    /// Store `conn` under its subdomain, applying the configured policy.
    ///
    /// A channel re-registering drops its own previous entry first, so one
    /// channel never holds more than one tunnel.
    pub async fn register(&self, conn: Arc<TunnelConnection>) -> Result<(), RegisterError> {
        let subdomain = conn.subdomain().to_string();
        let channel = conn.channel();

        let claim = match self
            .inner
            .registry
            .claim(conn, self.inner.settings.subdomain_policy)
            .await
        {
            Ok(claim) => claim,
            Err(e) => {
                warn!(subdomain = %subdomain, %channel, "Registration refused: {e}");
                return Err(e);
            }
        };

        if let Some(previous) = &claim.displaced {
            warn!(
                subdomain = %subdomain,
                old_channel = %previous.channel(),
                new_channel = %channel,
                "Subdomain re-registered, previous agent no longer routed"
            );
        }
        info!(subdomain = %subdomain, %channel, "Tunnel registered");

        if !claim.released.is_empty() {
            self.notify(&TopologyEvent::Removed {
                subdomains: claim.released,
            });
        }
        self.notify(&TopologyEvent::Registered { subdomain });
        Ok(())
    }

    pub async fn lookup(&self, subdomain: &str) -> Option<Arc<TunnelConnection>> {
        self.inner.registry.lookup(subdomain).await
    }

    pub async fn is_taken(&self, subdomain: &str) -> bool {
        self.inner.registry.is_taken(subdomain).await
    }

    /// Tear down everything owned by a closed channel: its registry entries and
    /// every request still waiting on it (failed with 502).
    ///
    /// Returns the subdomains that were removed.
    pub async fn remove_channel(&self, channel: ChannelId) -> Vec<String> {
        let removed = self.inner.registry.remove_by_channel(channel).await;
        for subdomain in &removed {
            info!(subdomain = %subdomain, %channel, "Removing tunnel for closed channel");
        }

        let failed = self
            .inner
            .pending
            .fail_channel(
                channel,
                &TunnelResponse::synthetic(502, "Tunnel disconnected"),
            )
            .await;
        if failed > 0 {
            info!(%channel, count = failed, "Failed pending requests of closed channel");
        }

        if !removed.is_empty() {
            self.notify(&TopologyEvent::Removed {
                subdomains: removed.clone(),
            });
        }
        removed
    }

    // ─── Forwarding ──────────────────────────────────────────────────────────

    /// Send `request` to the agent serving `subdomain`.
    ///
    /// Returns immediately after the send; the returned handle completes when
    /// the agent answers, its channel is torn down, or the request expires.
    /// A failed send completes it at once with 502.
    pub async fn forward(
        &self,
        subdomain: &str,
        request: ForwardRequest,
    ) -> Result<PendingResponse, NoTunnel> {
        let tunnels = self.inner.registry.read().await;
        let conn = tunnels
            .get(subdomain)
            .ok_or_else(|| NoTunnel(subdomain.to_string()))?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let pending = PendingResponse {
            request_id: request_id.clone(),
            rx,
        };

        if let Err(e) = self.inner.pending.add(&request_id, conn.channel(), tx).await {
            // Only reachable on an id collision; the sender is already dropped,
            // so `wait` yields a synthetic 502.
            warn!(subdomain, request_id, "Could not track request: {e}");
            return Ok(pending);
        }

        let message = ProtocolMessage::Request(RequestFrame {
            request_id: request_id.clone(),
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
        });

        if let Err(e) = conn.send(&message) {
            warn!(subdomain, request_id, "Failed to send request to agent: {e}");
            self.inner
                .pending
                .fail(
                    &request_id,
                    TunnelResponse::synthetic(502, "Failed to reach tunnel agent"),
                )
                .await;
        }
        drop(tunnels);

        Ok(pending)
    }

    /// Deliver a response to whoever is waiting on `request_id`.
    pub async fn resolve(&self, request_id: &str, response: TunnelResponse) -> bool {
        self.inner.pending.resolve(request_id, response).await
    }

    /// Deliver a `response` frame received on `channel`. Only requests that
    /// were sent on that same channel can be completed by it.
    pub async fn handle_response(&self, channel: ChannelId, frame: ResponseFrame) -> bool {
        let request_id = frame.request_id.clone();
        self.inner
            .pending
            .resolve_from(channel, &request_id, TunnelResponse::from(frame))
            .await
    }

    /// Fail pending requests older than the configured timeout. Returns the
    /// number expired (always 0 when expiry is disabled).
    pub async fn sweep_expired(&self) -> usize {
        let Some(max_age) = self.inner.settings.request_timeout else {
            return 0;
        };
        self.inner
            .pending
            .expire(
                max_age,
                &TunnelResponse::synthetic(504, "Tunnel did not respond in time"),
            )
            .await
    }

    /// Fail every pending request and forget every tunnel (server shutdown).
    pub async fn drain_all(&self) {
        let failed = self
            .inner
            .pending
            .fail_all(&TunnelResponse::synthetic(503, "Tunnel server shutting down"))
            .await;
        let removed = self.inner.registry.clear().await;
        info!(
            pending = failed,
            tunnels = removed.len(),
            "Drained tunnel state for shutdown"
        );
        if !removed.is_empty() {
            self.notify(&TopologyEvent::Removed { subdomains: removed });
        }
    }

    // ─── Reporting ───────────────────────────────────────────────────────────

    pub async fn active_count(&self) -> usize {
        self.inner.registry.active_count().await
    }

    pub fn total_registered(&self) -> u64 {
        self.inner.registry.total_registered()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub async fn snapshot(&self) -> Vec<TunnelInfo> {
        self.inner.registry.snapshot().await
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.len().await
    }

    pub async fn stats(&self) -> TunnelStats {
        let tunnels = self.snapshot().await;
        TunnelStats {
            total_tunnels: self.total_registered(),
            active_tunnels: tunnels.len(),
            pending_requests: self.pending_count().await,
            uptime: self.uptime().as_secs(),
            tunnels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn manager() -> TunnelManager {
        TunnelManager::new(ManagerSettings::default())
    }

    async fn register(
        mgr: &TunnelManager,
        subdomain: &str,
    ) -> (ChannelId, mpsc::Receiver<String>) {
        let channel = mgr.open_channel();
        let (tx, rx) = mpsc::channel(64);
        mgr.register(Arc::new(TunnelConnection::new(
            subdomain.to_string(),
            channel,
            tx,
        )))
        .await
        .unwrap();
        (channel, rx)
    }

    fn get(path: &str) -> ForwardRequest {
        ForwardRequest {
            method: "GET".into(),
            path: path.into(),
            ..Default::default()
        }
    }

    fn request_frame(text: &str) -> RequestFrame {
        match ProtocolMessage::decode(text).unwrap() {
            ProtocolMessage::Request(frame) => frame,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forward_without_tunnel() {
        let mgr = manager();
        let err = mgr.forward("ghost", get("/")).await.unwrap_err();
        assert_eq!(err, NoTunnel("ghost".into()));
        assert_eq!(mgr.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_forward_and_resolve() {
        let mgr = manager();
        let (channel, mut rx) = register(&mgr, "alpha").await;

        let pending = mgr.forward("alpha", get("/hello")).await.unwrap();
        let frame = request_frame(&rx.recv().await.unwrap());
        assert_eq!(frame.request_id, pending.request_id());
        assert_eq!(frame.method, "GET");
        assert_eq!(frame.path, "/hello");
        assert_eq!(mgr.pending_count().await, 1);

        let delivered = mgr
            .handle_response(
                channel,
                ResponseFrame {
                    request_id: frame.request_id.clone(),
                    status_code: 200,
                    headers: HashMap::new(),
                    body: b"hi".to_vec(),
                },
            )
            .await;
        assert!(delivered);

        let response = pending.wait().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hi");
        assert_eq!(mgr.pending_count().await, 0);
    }

    fn echo(frame: &RequestFrame) -> ResponseFrame {
        ResponseFrame {
            request_id: frame.request_id.clone(),
            status_code: 200,
            headers: HashMap::new(),
            body: frame.path.as_bytes().to_vec(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_correlation_with_permuted_replies() {
        let mgr = manager();
        let (channel, mut rx) = register(&mgr, "alpha").await;

        let mut clients = Vec::new();
        for i in 0..8 {
            let mgr = mgr.clone();
            clients.push(tokio::spawn(async move {
                let pending = mgr.forward("alpha", get(&format!("/item/{i}"))).await.unwrap();
                (i, pending.wait().await)
            }));
        }

        let mut frames = Vec::new();
        for _ in 0..8 {
            frames.push(request_frame(&rx.recv().await.unwrap()));
        }
        // Reply in a scrambled order, echoing the path as the body.
        let order = [5, 2, 7, 0, 3, 6, 1, 4];
        for idx in order {
            assert!(mgr.handle_response(channel, echo(&frames[idx])).await);
        }

        for client in clients {
            let (i, response) = client.await.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.body, format!("/item/{i}").as_bytes());
        }
        assert_eq!(mgr.pending_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forward_racing_teardown_settles_every_request() {
        const CLIENTS: usize = 48;
        let mgr = manager();
        let channel = mgr.open_channel();
        let (tx, mut rx) = mpsc::channel(CLIENTS);
        mgr.register(Arc::new(TunnelConnection::new("race".into(), channel, tx)))
            .await
            .unwrap();

        // Agent side: answers whatever reaches it until the channel closes.
        let agent = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    let frame = request_frame(&text);
                    mgr.handle_response(channel, echo(&frame)).await;
                }
            })
        };

        let start = Arc::new(tokio::sync::Barrier::new(CLIENTS + 1));
        let mut clients = Vec::new();
        for i in 0..CLIENTS {
            let mgr = mgr.clone();
            let start = start.clone();
            clients.push(tokio::spawn(async move {
                start.wait().await;
                let path = format!("/r/{i}");
                let pending = match mgr.forward("race", get(&path)).await {
                    Ok(pending) => pending,
                    Err(NoTunnel(_)) => return None,
                };
                let response = tokio::time::timeout(Duration::from_secs(5), pending.wait())
                    .await
                    .expect("forwarded request never settled");
                Some((path, response))
            }));
        }
        let teardown = {
            let mgr = mgr.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                tokio::task::yield_now().await;
                mgr.remove_channel(channel).await
            })
        };

        for client in clients {
            if let Some((path, response)) = client.await.unwrap() {
                match response.status {
                    200 => assert_eq!(response.body, path.as_bytes()),
                    502 => {}
                    other => panic!("unexpected status {other} for {path}"),
                }
            }
        }
        assert_eq!(teardown.await.unwrap(), vec!["race"]);
        tokio::time::timeout(Duration::from_secs(5), agent)
            .await
            .expect("agent channel stayed open after teardown")
            .unwrap();

        assert!(!mgr.is_taken("race").await);
        assert_eq!(mgr.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_twice_fires_once() {
        let mgr = manager();
        let (_channel, mut rx) = register(&mgr, "alpha").await;
        let pending = mgr.forward("alpha", get("/")).await.unwrap();
        let id = request_frame(&rx.recv().await.unwrap()).request_id;

        assert!(mgr.resolve(&id, TunnelResponse::synthetic(200, "one")).await);
        assert!(!mgr.resolve(&id, TunnelResponse::synthetic(200, "two")).await);
        assert_eq!(pending.wait().await.body, b"one");
    }

    #[tokio::test]
    async fn test_send_failure_yields_502_and_no_residue() {
        let mgr = manager();
        let (_channel, rx) = register(&mgr, "alpha").await;
        drop(rx);

        let pending = mgr.forward("alpha", get("/")).await.unwrap();
        assert_eq!(mgr.pending_count().await, 0);
        assert_eq!(pending.wait().await.status, 502);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_and_fails_pending() {
        let mgr = manager();
        let (channel, _rx) = register(&mgr, "foo").await;
        let pending = mgr.forward("foo", get("/slow")).await.unwrap();

        assert_eq!(mgr.remove_channel(channel).await, vec!["foo"]);
        assert!(mgr.lookup("foo").await.is_none());
        assert!(!mgr.is_taken("foo").await);
        assert_eq!(pending.wait().await.status, 502);
        assert_eq!(mgr.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_overwrite_policy() {
        let mgr = manager();
        let (first, _rx1) = register(&mgr, "alpha").await;
        let (second, _rx2) = register(&mgr, "alpha").await;

        assert_eq!(mgr.lookup("alpha").await.unwrap().channel(), second);
        // Closing the displaced agent must not evict the new one.
        assert!(mgr.remove_channel(first).await.is_empty());
        assert!(mgr.is_taken("alpha").await);
        assert_eq!(mgr.total_registered(), 2);
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let mgr = TunnelManager::new(ManagerSettings {
            subdomain_policy: SubdomainPolicy::Reject,
            request_timeout: None,
        });
        let (first, _rx1) = register(&mgr, "alpha").await;

        let (tx, _rx2) = mpsc::channel(1);
        let intruder = Arc::new(TunnelConnection::new("alpha".into(), mgr.open_channel(), tx));
        assert_eq!(
            mgr.register(intruder).await,
            Err(RegisterError::Taken("alpha".into()))
        );
        assert_eq!(mgr.lookup("alpha").await.unwrap().channel(), first);
    }

    #[tokio::test]
    async fn test_reregister_on_same_channel_moves_entry() {
        let mgr = manager();
        let (channel, _rx) = register(&mgr, "old").await;
        let (tx, _rx2) = mpsc::channel(1);
        mgr.register(Arc::new(TunnelConnection::new("new".into(), channel, tx)))
            .await
            .unwrap();

        assert!(!mgr.is_taken("old").await);
        assert!(mgr.is_taken("new").await);
        assert_eq!(mgr.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_response_from_foreign_channel_is_ignored() {
        let mgr = manager();
        let (_owner, mut rx) = register(&mgr, "alpha").await;
        let (other, _rx2) = register(&mgr, "beta").await;
        let _pending = mgr.forward("alpha", get("/")).await.unwrap();
        let id = request_frame(&rx.recv().await.unwrap()).request_id;

        let frame = ResponseFrame {
            request_id: id,
            status_code: 200,
            ..Default::default()
        };
        assert!(!mgr.handle_response(other, frame).await);
        assert_eq!(mgr.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let mgr = TunnelManager::new(ManagerSettings {
            subdomain_policy: SubdomainPolicy::Overwrite,
            request_timeout: Some(Duration::ZERO),
        });
        let (_channel, _rx) = register(&mgr, "alpha").await;
        let pending = mgr.forward("alpha", get("/")).await.unwrap();

        assert_eq!(mgr.sweep_expired().await, 1);
        assert_eq!(pending.wait().await.status, 504);

        // Disabled expiry never sweeps.
        let idle = manager();
        assert_eq!(idle.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn test_listeners_see_register_and_remove() {
        let mgr = manager();
        let seen: Arc<Mutex<Vec<TopologyEvent>>> = Arc::default();
        let sink = seen.clone();
        mgr.subscribe(Arc::new(move |e: &TopologyEvent| {
            sink.lock().unwrap().push(e.clone());
        }));

        let (channel, _rx) = register(&mgr, "alpha").await;
        mgr.remove_channel(channel).await;

        let events = seen.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                TopologyEvent::Registered {
                    subdomain: "alpha".into()
                },
                TopologyEvent::Removed {
                    subdomains: vec!["alpha".into()]
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let mgr = manager();
        let (channel, _rx) = register(&mgr, "beta").await;
        let (_c2, _rx2) = register(&mgr, "alpha").await;
        mgr.remove_channel(channel).await;

        let stats = mgr.stats().await;
        assert_eq!(stats.total_tunnels, 2);
        assert_eq!(stats.active_tunnels, 1);
        assert_eq!(stats.pending_requests, 0);
        assert_eq!(stats.tunnels[0].subdomain, "alpha");

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["activeTunnels"], 1);
        assert_eq!(json["totalTunnels"], 2);
        assert!(json["tunnels"][0]["connectedTime"].is_u64());
    }

    #[tokio::test]
    async fn test_drain_all() {
        let mgr = manager();
        let (_channel, _rx) = register(&mgr, "alpha").await;
        let pending = mgr.forward("alpha", get("/")).await.unwrap();

        mgr.drain_all().await;
        assert_eq!(pending.wait().await.status, 503);
        assert_eq!(mgr.active_count().await, 0);
    }
}
