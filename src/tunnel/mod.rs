//! Reverse tunnel core.
//!
//! Agents behind NAT open a WebSocket control channel to `/tunnel`, claim a
//! subdomain with a `register` message, and from then on receive public HTTP
//! requests for `<subdomain>.<domain>` as JSON `request` frames. They answer
//! with `response` frames carrying the same request id, in any order.
//!
//! - [`manager`] - owns the registry and pending table; forward/resolve
//! - [`handler`] - per-channel state machine and WebSocket pump
//! - [`router`] - host classification and HTTP forwarding glue
//! - [`protocol`] - wire messages and body codec

pub mod connection;
pub mod handler;
pub mod manager;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod router;

pub use connection::{ChannelId, SendError, TunnelConnection};
pub use handler::{ControlSession, SessionSettings, SessionState};
pub use manager::{
    ForwardRequest, ManagerSettings, NoTunnel, PendingResponse, TopologyEvent, TopologyListener,
    TunnelManager, TunnelStats,
};
pub use pending::TunnelResponse;
pub use protocol::{ProtocolMessage, RequestFrame, ResponseFrame};
pub use registry::{RegisterError, SubdomainPolicy, TunnelInfo};
