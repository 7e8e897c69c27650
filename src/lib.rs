//! claude-relay library
//!
//! A multi-machine remote terminal relay: session launchers own PTY
//! children and advertise through a filesystem registry; the hub serves
//! browser clients over TLS WebSockets and bridges them onto local
//! session channels; agents mirror the surface on peer machines and
//! federate through the hub's machine registry.

pub mod agent;
pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub(crate) mod crypto;
pub mod launcher;
pub mod logging;
pub mod machines;
pub mod projects;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod term;
pub mod tls;
pub mod util;
