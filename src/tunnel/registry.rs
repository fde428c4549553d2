//! Subdomain registry - the single source of truth for routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};

use super::connection::{ChannelId, TunnelConnection};

/// What to do when an agent claims a subdomain another channel holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubdomainPolicy {
    /// Last register wins; the previous agent stops receiving traffic.
    #[default]
    Overwrite,
    /// Refuse the newcomer while the holder's channel is alive.
    Reject,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("subdomain '{0}' is already taken")]
    Taken(String),
}

/// Outcome of a successful [`Registry::claim`].
#[derive(Debug, Default)]
pub struct Claim {
    /// Another channel's connection that previously held the subdomain.
    pub displaced: Option<Arc<TunnelConnection>>,
    /// Subdomains this channel held before and gave up by re-registering.
    pub released: Vec<String>,
}

/// Reporting view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub subdomain: String,
    /// Registration time, milliseconds since the Unix epoch.
    pub connected_time: u64,
    /// Internal channel id; kept out of the dashboard JSON.
    #[serde(skip)]
    pub channel: u64,
}

#[derive(Default)]
pub struct Registry {
    tunnels: RwLock<HashMap<String, Arc<TunnelConnection>>>,
    total_registered: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` as one atomic step: apply `policy` against other
    /// channels, drop whatever this channel held before, then insert.
    /// Under [`SubdomainPolicy::Overwrite`] this never fails and the previous
    /// holder comes back in [`Claim::displaced`].
    pub async fn claim(
        &self,
        conn: Arc<TunnelConnection>,
        policy: SubdomainPolicy,
    ) -> Result<Claim, RegisterError> {
        let subdomain = conn.subdomain().to_string();
        let channel = conn.channel();
        let mut tunnels = self.tunnels.write().await;

        if policy == SubdomainPolicy::Reject
            && tunnels
                .get(&subdomain)
                .is_some_and(|holder| holder.channel() != channel)
        {
            return Err(RegisterError::Taken(subdomain));
        }

        let mut released = Vec::new();
        tunnels.retain(|s, c| {
            if c.channel() == channel && *s != subdomain {
                released.push(s.clone());
                false
            } else {
                true
            }
        });

        let displaced = tunnels
            .insert(subdomain, conn)
            .filter(|previous| previous.channel() != channel);
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        Ok(Claim {
            displaced,
            released,
        })
    }

    pub async fn lookup(&self, subdomain: &str) -> Option<Arc<TunnelConnection>> {
        self.tunnels.read().await.get(subdomain).cloned()
    }

    pub async fn is_taken(&self, subdomain: &str) -> bool {
        self.tunnels.read().await.contains_key(subdomain)
    }

    /// Hold the read side while a forward looks up and sends, so a teardown
    /// cannot land between the two.
    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<TunnelConnection>>> {
        self.tunnels.read().await
    }

    /// Remove every entry owned by `channel`. Returns the removed subdomains.
    pub async fn remove_by_channel(&self, channel: ChannelId) -> Vec<String> {
        let mut tunnels = self.tunnels.write().await;
        let mut removed = Vec::new();
        tunnels.retain(|subdomain, conn| {
            if conn.channel() == channel {
                removed.push(subdomain.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove everything (shutdown).
    pub async fn clear(&self) -> Vec<String> {
        self.tunnels.write().await.drain().map(|(k, _)| k).collect()
    }

    pub async fn active_count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Monotonic count of successful registrations since startup.
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }

    /// Owned copy of the current entries, sorted by subdomain.
    pub async fn snapshot(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.read().await;
        let mut list: Vec<TunnelInfo> = tunnels
            .iter()
            .map(|(subdomain, conn)| TunnelInfo {
                subdomain: subdomain.clone(),
                connected_time: unix_millis(conn.connected_at()),
                channel: conn.channel().0,
            })
            .collect();
        list.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        list
    }
}

#[allow(clippy::cast_possible_truncation)]
fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
