//! Error types.
//!
//! Authentication and permission failures are not errors here: they are
//! ordinary responses. These enums only cover conditions that abort startup,
//! poison the database, or break the client transport.

use std::path::PathBuf;
use thiserror::Error;

/// Conditions that prevent the server from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("policy {policy} requires {which} to be configured")]
    MissingDirectory {
        policy: &'static str,
        which: &'static str,
    },

    #[error("secret directory {path} is not usable: {reason}")]
    UnusableDirectory { path: PathBuf, reason: String },

    #[error("cannot open activity log {path}: {source}")]
    ActivityLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open database: {0}")]
    Database(#[from] EngineError),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Errors raised by the database behind the command engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The database can no longer be trusted; the server must stop.
    #[error("fatal database error: {0}")]
    Fatal(String),

    #[error("database I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors seen by [`crate::client::AceClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("cannot read secret file {path}: {source}")]
    SecretFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secret file {path} does not contain a number")]
    MalformedSecret { path: PathBuf },

    #[error("no access tier is reachable from this client")]
    NoAccess,

    #[error("session was closed by the server: {0}")]
    SessionClosed(String),
}
