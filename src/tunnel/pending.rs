//! In-flight forwarded requests awaiting an agent's reply.
//!
//! Each entry holds the oneshot half that completes the public request. An
//! entry leaves the table exactly once, and whoever removes it is the only
//! one that can complete it: a matching `response`, a failed send, the owning
//! channel's teardown, or expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, warn};

use super::connection::ChannelId;
use super::protocol::ResponseFrame;

/// The terminal result delivered to a waiting public request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TunnelResponse {
    /// A server-generated plain-text response (the agent never saw the request,
    /// or never answered it).
    pub fn synthetic(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "text/plain; charset=UTF-8".to_string(),
            )]),
            body: message.as_bytes().to_vec(),
        }
    }
}

impl From<ResponseFrame> for TunnelResponse {
    fn from(frame: ResponseFrame) -> Self {
        Self {
            status: frame.status_code,
            headers: frame.headers,
            body: frame.body,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("request id {0} is already pending")]
    Duplicate(String),
}

struct PendingRequest {
    channel: ChannelId,
    created_at: Instant,
    completion: oneshot::Sender<TunnelResponse>,
}

impl PendingRequest {
    fn complete(self, request_id: &str, response: TunnelResponse) {
        if self.completion.send(response).is_err() {
            // The public client went away; nothing left to deliver to.
            warn!(request_id, "Public request dropped before its response arrived");
        }
    }
}

#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request sent on `channel`. Ids are minted fresh per forward, so
    /// a collision is a bug; it is refused rather than overwriting.
    pub async fn add(
        &self,
        request_id: &str,
        channel: ChannelId,
        completion: oneshot::Sender<TunnelResponse>,
    ) -> Result<(), PendingError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(request_id) {
            error!(request_id, "Duplicate pending request id");
            return Err(PendingError::Duplicate(request_id.to_string()));
        }
        entries.insert(
            request_id.to_string(),
            PendingRequest {
                channel,
                created_at: Instant::now(),
                completion,
            },
        );
        Ok(())
    }

    /// Complete `request_id` with `response`. Returns `false` (and logs) if no
    /// such request is pending.
    pub async fn resolve(&self, request_id: &str, response: TunnelResponse) -> bool {
        let entry = self.entries.lock().await.remove(request_id);
        if let Some(entry) = entry {
            entry.complete(request_id, response);
            true
        } else {
            warn!(
                request_id,
                "Response arrived for timed-out or unknown request (dropped)"
            );
            false
        }
    }

    /// Like [`resolve`](Self::resolve), but only when the request was sent on
    /// `channel`. A reply naming another channel's request is dropped and the
    /// entry is left alone.
    pub async fn resolve_from(
        &self,
        channel: ChannelId,
        request_id: &str,
        response: TunnelResponse,
    ) -> bool {
        let entry = {
            let mut entries = self.entries.lock().await;
            match entries.get(request_id) {
                Some(e) if e.channel == channel => entries.remove(request_id),
                Some(_) => {
                    warn!(%channel, request_id, "Response for a request owned by another channel (dropped)");
                    return false;
                }
                None => None,
            }
        };
        if let Some(entry) = entry {
            entry.complete(request_id, response);
            true
        } else {
            warn!(
                %channel,
                request_id,
                "Response arrived for timed-out or unknown request (dropped)"
            );
            false
        }
    }

    /// Complete `request_id` with a server-generated response. Same removal
    /// contract as [`resolve`](Self::resolve).
    pub async fn fail(&self, request_id: &str, response: TunnelResponse) -> bool {
        let entry = self.entries.lock().await.remove(request_id);
        entry.is_some_and(|entry| {
            entry.complete(request_id, response);
            true
        })
    }

    /// Fail every request sent on `channel`. Returns how many were failed.
    pub async fn fail_channel(&self, channel: ChannelId, response: &TunnelResponse) -> usize {
        let drained = self
            .drain_where(|entry| entry.channel == channel)
            .await;
        let count = drained.len();
        for (request_id, entry) in drained {
            entry.complete(&request_id, response.clone());
        }
        count
    }

    /// Fail every request older than `max_age`. Returns how many were failed.
    pub async fn expire(&self, max_age: Duration, response: &TunnelResponse) -> usize {
        let now = Instant::now();
        let drained = self
            .drain_where(|entry| now.saturating_duration_since(entry.created_at) >= max_age)
            .await;
        let count = drained.len();
        for (request_id, entry) in drained {
            warn!(request_id, channel = %entry.channel, "Pending request expired");
            entry.complete(&request_id, response.clone());
        }
        count
    }

    /// Fail everything (shutdown).
    pub async fn fail_all(&self, response: &TunnelResponse) -> usize {
        let drained = self.drain_where(|_| true).await;
        let count = drained.len();
        for (request_id, entry) in drained {
            entry.complete(&request_id, response.clone());
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Remove matching entries under the lock; completion happens after it is released.
    async fn drain_where(
        &self,
        mut pred: impl FnMut(&PendingRequest) -> bool,
    ) -> Vec<(String, PendingRequest)> {
        let mut entries = self.entries.lock().await;
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
            .collect()
    }
}
