//! Request and response envelopes exchanged with clients.
//!
//! `encore` stays an integer on the wire (0 normal, 2 continuation, 3 bulk
//! ingest) but is a closed enum everywhere else.

use crate::registry::{ClientId, Handshake};
use serde::{Deserialize, Serialize};

pub const MSG_UNAUTHORISED: &str = "// Unauthorised access, closing connection";
pub const MSG_REFUSING: &str =
    "// Sorry, the server is shutting down and does not accept new connections";
pub const MSG_WELCOME: &str = "// Session established";

/// What the caller wants done with `request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestMode {
    /// `request` is a single command line.
    #[default]
    Command,
    /// Deliver more output of the previous command; `request` is ignored.
    Continue,
    /// `request` is a batch of data definitions.
    Ingest,
}

impl TryFrom<u8> for RequestMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestMode::Command),
            2 => Ok(RequestMode::Continue),
            3 => Ok(RequestMode::Ingest),
            other => Err(format!("invalid encore value {}", other)),
        }
    }
}

impl From<RequestMode> for u8 {
    fn from(mode: RequestMode) -> u8 {
        match mode {
            RequestMode::Command => 0,
            RequestMode::Continue => 2,
            RequestMode::Ingest => 3,
        }
    }
}

/// Whether the caller should ask for a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Encore {
    #[default]
    Done,
    More,
}

impl TryFrom<u8> for Encore {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Encore::Done),
            2 => Ok(Encore::More),
            other => Err(format!("invalid encore value {}", other)),
        }
    }
}

impl From<Encore> for u8 {
    fn from(encore: Encore) -> u8 {
        match encore {
            Encore::Done => 0,
            Encore::More => 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Zero on first contact.
    #[serde(default)]
    pub client_id: ClientId,
    #[serde(default)]
    pub magic: u64,
    #[serde(default)]
    pub request: String,
    /// Caller's response cap in bytes; zero means no preference.
    #[serde(default)]
    pub max_bytes: usize,
    #[serde(default)]
    pub encore: RequestMode,
}

impl RpcRequest {
    pub fn hello() -> Self {
        Self::default()
    }

    pub fn command(client_id: ClientId, magic: u64, line: impl Into<String>) -> Self {
        Self {
            client_id,
            magic,
            request: line.into(),
            ..Self::default()
        }
    }

    pub fn continuation(client_id: ClientId, magic: u64) -> Self {
        Self {
            client_id,
            magic,
            encore: RequestMode::Continue,
            ..Self::default()
        }
    }

    pub fn ingest(client_id: ClientId, magic: u64, data: impl Into<String>) -> Self {
        Self {
            client_id,
            magic,
            request: data.into(),
            encore: RequestMode::Ingest,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Zero tells the caller its session is gone.
    pub client_id: ClientId,
    /// Only set on the session-creation response.
    #[serde(default)]
    pub magic: u64,
    /// Path of the write secret file, or a sentinel. Only on session creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_secret: Option<String>,
    /// Path of the read secret file, or a sentinel. Only on session creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_secret: Option<String>,
    pub text: String,
    #[serde(default)]
    pub encore: Encore,
}

impl RpcResponse {
    pub fn reply(client_id: ClientId, text: impl Into<String>, encore: Encore) -> Self {
        Self {
            client_id,
            text: text.into(),
            encore,
            ..Self::default()
        }
    }

    /// The session no longer exists; the caller must start over.
    pub fn closed(text: impl Into<String>) -> Self {
        Self::reply(0, text, Encore::Done)
    }

    pub fn handshake(hs: &Handshake) -> Self {
        Self {
            client_id: hs.client_id,
            magic: hs.client_magic,
            write_secret: Some(hs.write_hint.to_wire()),
            read_secret: Some(hs.read_hint.to_wire()),
            text: MSG_WELCOME.to_string(),
            encore: Encore::Done,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.client_id == 0
    }
}
