//! HTTP route handlers for the base domain.
//!
//! None of these require authentication; they expose only what a public
//! status page would show.

pub mod events;
pub mod health;
pub mod stats;
