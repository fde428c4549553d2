#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]

//! tunneld library - the building blocks of the tunnel server.
//!
//! - `tunnel` - registry, pending requests, agent protocol, host routing
//! - `auth` - agent token validation
//! - `config` - configuration loading
//! - `routes` - base-domain dashboard endpoints
//! - `server` - router assembly and background tasks

pub mod auth;
pub mod config;
pub mod routes;
pub mod server;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use state::AppState;
pub use tunnel::TunnelManager;
