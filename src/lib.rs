//! Session-authenticated command server.
//!
//! Clients open a session with `client_id = 0`, read the secret the server
//! published for them in a shared directory, and present it on every later
//! request. Authenticated requests are forwarded to a per-session command
//! engine; idle sessions are reaped and the process exits once nobody has
//! been connected for a while.

pub mod activity_log;
pub mod auth;
pub mod client;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod http_server;
pub mod memstore;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod secret;
pub mod server;
pub mod state;
