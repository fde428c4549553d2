//! Agent control channel: registration state machine and WebSocket pump.
//!
//! Each accepted `GET /tunnel` upgrade gets its own [`ControlSession`]. Frames
//! read from the socket drive the session; frames written to the agent go
//! through a bounded queue drained by a dedicated writer task, the same queue
//! the manager uses to forward public requests.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::connection::{ChannelId, TunnelConnection};
use super::manager::TunnelManager;
use super::protocol::ProtocolMessage;
use super::registry::RegisterError;
use crate::auth::{validator_from_config, TokenValidator};
use crate::config::{Config, TunnelConfig};
use crate::state::AppState;

/// Everything a session needs to decide on and answer a `register`.
#[derive(Clone)]
pub struct SessionSettings {
    pub validator: Arc<dyn TokenValidator>,
    pub tunnel: TunnelConfig,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            validator: validator_from_config(&config.auth),
            tunnel: config.tunnel.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, nothing claimed yet.
    Connected,
    Registered { subdomain: String },
    /// Terminal.
    Closed,
}

/// Per-channel protocol state.
pub struct ControlSession {
    manager: TunnelManager,
    settings: Arc<SessionSettings>,
    channel: ChannelId,
    outbound: mpsc::Sender<String>,
    state: SessionState,
}

impl ControlSession {
    /// Open a session on a fresh channel. The returned receiver yields the
    /// text frames to write to the agent.
    pub fn new(
        manager: TunnelManager,
        settings: Arc<SessionSettings>,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(settings.tunnel.channel_capacity.max(1));
        let channel = manager.open_channel();
        let session = Self {
            manager,
            settings,
            channel,
            outbound,
            state: SessionState::Connected,
        };
        (session, rx)
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Process one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        let message = match ProtocolMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %self.channel, "Dropping undecodable frame: {e}");
                return;
            }
        };

        match message {
            ProtocolMessage::Register {
                subdomain,
                auth_token,
            } => self.register(subdomain, &auth_token).await,
            ProtocolMessage::Response(frame) if self.is_registered() => {
                self.manager.handle_response(self.channel, frame).await;
            }
            other => {
                warn!(
                    channel = %self.channel,
                    kind = other.kind(),
                    state = ?self.state,
                    "Ignoring unexpected message"
                );
            }
        }
    }

    /// Tear the channel down. Idempotent; returns the subdomains that were
    /// removed the first time.
    pub async fn close(&mut self) -> Vec<String> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        self.state = SessionState::Closed;
        self.manager.remove_channel(self.channel).await
    }

    fn is_registered(&self) -> bool {
        matches!(self.state, SessionState::Registered { .. })
    }

    async fn register(&mut self, subdomain: String, auth_token: &str) {
        if !self.settings.validator.is_valid(auth_token) {
            warn!(channel = %self.channel, subdomain = %subdomain, "Registration with invalid auth token");
            self.reply(&ProtocolMessage::error("Invalid auth token"));
            return;
        }
        if !is_valid_subdomain(&subdomain) {
            warn!(channel = %self.channel, subdomain = %subdomain, "Registration with invalid subdomain");
            self.reply(&ProtocolMessage::error("Invalid subdomain"));
            return;
        }

        let conn = Arc::new(TunnelConnection::new(
            subdomain.clone(),
            self.channel,
            self.outbound.clone(),
        ));
        match self.manager.register(conn).await {
            Ok(()) => {
                let public_url = self.settings.tunnel.public_url(&subdomain);
                self.state = SessionState::Registered {
                    subdomain: subdomain.clone(),
                };
                self.reply(&ProtocolMessage::Registered {
                    subdomain,
                    public_url,
                });
            }
            Err(RegisterError::Taken(_)) => {
                self.reply(&ProtocolMessage::error("Subdomain already taken"));
            }
        }
    }

    fn reply(&self, message: &ProtocolMessage) {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(channel = %self.channel, "Failed to encode reply: {e}");
                return;
            }
        };
        if self.outbound.try_send(text).is_err() {
            warn!(channel = %self.channel, kind = message.kind(), "Could not queue reply to agent");
        }
    }
}

/// DNS label check: 1-63 ASCII alphanumerics or `-`, no leading or trailing `-`.
pub fn is_valid_subdomain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && !s.starts_with('-')
        && !s.ends_with('-')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// `GET /tunnel` - agent WebSocket upgrade.
pub async fn agent_ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_frame = state.config.server.max_frame_bytes();
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| {
            let (session, outbound_rx) =
                ControlSession::new(state.manager.clone(), state.sessions.clone());
            let channel = session.channel();
            handle_agent_ws(socket, session, outbound_rx)
                .instrument(info_span!("tunnel_agent", %channel))
        })
}

async fn handle_agent_ws(
    socket: WebSocket,
    mut session: ControlSession,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    info!("Agent connected");
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outbound queue -> socket
    let send_task = tokio::spawn(
        async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
        .in_current_span(),
    );

    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Binary(data)) => {
                debug!(len = data.len(), "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Agent socket error: {e}");
                break;
            }
        }
    }

    let removed = session.close().await;
    send_task.abort();
    info!(subdomains = ?removed, "Agent disconnected");
}
