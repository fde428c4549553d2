//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::routes::events::StatsFeed;
use crate::tunnel::{ManagerSettings, SessionSettings, TopologyEvent, TunnelManager};

/// Capacity of the topology broadcast feeding SSE clients.
const TOPOLOGY_EVENT_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Registry and pending-request table; the only place routing state lives.
    pub manager: TunnelManager,
    /// Registration policy handed to every agent control channel.
    pub sessions: Arc<SessionSettings>,
    /// Tunnel registrations and removals, for SSE subscribers.
    pub topology_events: broadcast::Sender<TopologyEvent>,
    /// Current number of SSE connections (for connection limiting).
    pub sse_connections: Arc<AtomicU32>,
}

impl AppState {
    /// Build the manager from `config` and wire the SSE feed to it.
    pub fn new(config: Config) -> Self {
        let manager = TunnelManager::new(ManagerSettings {
            subdomain_policy: config.tunnel.subdomain_policy,
            request_timeout: config.tunnel.request_timeout(),
        });
        let (topology_events, _) = broadcast::channel(TOPOLOGY_EVENT_CAPACITY);
        manager.subscribe(Arc::new(StatsFeed::new(topology_events.clone())));

        Self {
            sessions: Arc::new(SessionSettings::from_config(&config)),
            config: Arc::new(config),
            manager,
            topology_events,
            sse_connections: Arc::new(AtomicU32::new(0)),
        }
    }
}
