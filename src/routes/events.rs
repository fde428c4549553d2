//! Server-Sent Events (SSE) stats feed.
//!
//! `GET /events` - pushes a full [`TunnelStats`](crate::tunnel::TunnelStats)
//! snapshot on connect and again after every tunnel registration or removal.
//! The manager notifies a [`StatsFeed`] listener, which fans the change out
//! over a broadcast channel; each stream re-reads the stats when woken, so a
//! lagging client simply skips to the latest snapshot.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::tunnel::{TopologyEvent, TopologyListener, TunnelManager};
use crate::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 64;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Topology listener that republishes changes to SSE subscribers.
pub struct StatsFeed {
    tx: broadcast::Sender<TopologyEvent>,
}

impl StatsFeed {
    pub fn new(tx: broadcast::Sender<TopologyEvent>) -> Self {
        Self { tx }
    }
}

impl TopologyListener for StatsFeed {
    fn on_topology_change(&self, event: &TopologyEvent) {
        // No subscribers is the common case.
        let _ = self.tx.send(event.clone());
    }
}

/// `GET /events` - SSE stats stream.
pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.sse_connections.load(Ordering::Relaxed);
    if current >= MAX_SSE_CONNECTIONS {
        warn!(current, "Rejecting SSE client, connection limit reached");
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too many SSE connections"));
    }
    state.sse_connections.fetch_add(1, Ordering::Relaxed);
    debug!("SSE client connected");

    let rx = state.topology_events.subscribe();
    let manager = state.manager.clone();

    // First poll emits the current snapshot without waiting.
    let stream = futures::stream::unfold(
        (rx, manager, true),
        |(mut rx, manager, first)| async move {
            if !first {
                match rx.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
            let event = stats_event(&manager).await;
            Some((Ok(event), (rx, manager, false)))
        },
    );

    let stream = DropCounterStream {
        inner: Box::pin(stream),
        counter: state.sse_connections.clone(),
        decremented: false,
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("heartbeat"),
    ))
}

async fn stats_event(manager: &TunnelManager) -> Event {
    let stats = manager.stats().await;
    let data = serde_json::to_string(&stats).unwrap_or_default();
    Event::default().data(data)
}

/// Wrapper that decrements the SSE connection counter when the stream ends
/// or is dropped.
struct DropCounterStream<S> {
    inner: Pin<Box<S>>,
    counter: Arc<AtomicU32>,
    decremented: bool,
}

impl<S> DropCounterStream<S> {
    fn release(&mut self) {
        if !self.decremented {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for DropCounterStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let result = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = &result {
            self.release();
        }
        result
    }
}

impl<S> Drop for DropCounterStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stats_feed_forwards_events() {
        let (tx, mut rx) = broadcast::channel(4);
        let feed = StatsFeed::new(tx);
        let event = TopologyEvent::Registered {
            subdomain: "alpha".into(),
        };
        feed.on_topology_change(&event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_stats_feed_without_subscribers() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        StatsFeed::new(tx).on_topology_change(&TopologyEvent::Removed {
            subdomains: vec!["alpha".into()],
        });
    }

    #[tokio::test]
    async fn test_drop_counter_releases_once() {
        let counter = Arc::new(AtomicU32::new(1));
        let mut stream = DropCounterStream {
            inner: Box::pin(futures::stream::empty::<Result<Event, Infallible>>()),
            counter: counter.clone(),
            decremented: false,
        };
        assert!(stream.next().await.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        drop(stream);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
