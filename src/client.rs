//! Client side of the protocol.
//!
//! Performs the handshake, picks up the secret the server published for it,
//! and follows continuations.

use crate::auth::Access;
use crate::error::ClientError;
use crate::protocol::{Encore, RpcRequest, RpcResponse};
use crate::registry::ClientId;
use crate::secret::{self, NON_WRITABLE, PUBLIC, RESTRICTED};
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct AceClient {
    http: reqwest::Client,
    endpoint: String,
    client_id: ClientId,
    magic: u64,
    access: Access,
    max_bytes: usize,
}

/// Which tier to try for when both secrets are readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prefer {
    #[default]
    Write,
    Read,
}

fn hint_path(hint: Option<&str>) -> Option<PathBuf> {
    match hint {
        None | Some(NON_WRITABLE) | Some(PUBLIC) | Some(RESTRICTED) => None,
        Some(path) => Some(PathBuf::from(path)),
    }
}

fn read_secret_file(path: PathBuf) -> Result<u64, ClientError> {
    let contents = std::fs::read_to_string(&path)
        .map_err(|source| ClientError::SecretFile { path: path.clone(), source })?;
    secret::parse_secret(&contents).ok_or(ClientError::MalformedSecret { path })
}

/// Decide which secret to present from a handshake response.
fn choose_secret(resp: &RpcResponse, prefer: Prefer) -> Result<(u64, Access), ClientError> {
    let write = hint_path(resp.write_secret.as_deref());
    let read = hint_path(resp.read_secret.as_deref());

    if prefer == Prefer::Write {
        if let Some(path) = write {
            match read_secret_file(path) {
                Ok(magic) => return Ok((magic, Access::Write)),
                // No access to the write directory: fall back to read.
                Err(e) => debug!(error = %e, "Write secret not readable"),
            }
        }
    }
    if let Some(path) = read {
        return Ok((read_secret_file(path)?, Access::Read));
    }
    if resp.read_secret.as_deref() == Some(PUBLIC) {
        return Ok((0, Access::Read));
    }
    Err(ClientError::NoAccess)
}

impl AceClient {
    /// Open a session on the server at `base_url` (e.g. `http://127.0.0.1:8080`).
    pub async fn connect(base_url: &str) -> Result<Self, ClientError> {
        Self::connect_with(base_url, Prefer::Write).await
    }

    pub async fn connect_with(base_url: &str, prefer: Prefer) -> Result<Self, ClientError> {
        let http = reqwest::Client::new();
        let endpoint = format!("{}/rpc", base_url.trim_end_matches('/'));
        let resp = post(&http, &endpoint, &RpcRequest::hello()).await?;
        if resp.is_closed() {
            return Err(ClientError::SessionClosed(resp.text));
        }
        let (magic, access) = match choose_secret(&resp, prefer) {
            Ok(chosen) => chosen,
            Err(e) => {
                abandon(&http, &endpoint, resp.client_id).await;
                return Err(e);
            }
        };
        debug!(client_id = resp.client_id, access = access.as_str(), "Session established");
        Ok(Self {
            http,
            endpoint,
            client_id: resp.client_id,
            magic,
            access,
            max_bytes: 0,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    /// Send a raw request with this session's credentials filled in.
    pub async fn call(&mut self, mut req: RpcRequest) -> Result<RpcResponse, ClientError> {
        if self.client_id == 0 {
            return Err(ClientError::SessionClosed("session already ended".to_string()));
        }
        req.client_id = self.client_id;
        req.magic = self.magic;
        req.max_bytes = self.max_bytes;
        let resp = post(&self.http, &self.endpoint, &req).await?;
        if resp.is_closed() {
            self.client_id = 0;
        }
        Ok(resp)
    }

    /// Run one command and return only its first page.
    pub async fn command(&mut self, line: &str) -> Result<RpcResponse, ClientError> {
        self.call(RpcRequest::command(0, 0, line)).await
    }

    /// Run one command and collect every page of its output.
    pub async fn command_all(&mut self, line: &str) -> Result<String, ClientError> {
        let mut resp = self.command(line).await?;
        let mut text = String::new();
        loop {
            if resp.is_closed() {
                return Err(ClientError::SessionClosed(resp.text));
            }
            text.push_str(&resp.text);
            if resp.encore != Encore::More {
                return Ok(text);
            }
            resp = self.call(RpcRequest::continuation(0, 0)).await?;
        }
    }

    /// Send a batch of data definitions.
    pub async fn ingest(&mut self, data: &str) -> Result<String, ClientError> {
        let resp = self.call(RpcRequest::ingest(0, 0, data)).await?;
        if resp.is_closed() {
            return Err(ClientError::SessionClosed(resp.text));
        }
        Ok(resp.text)
    }

    pub async fn quit(mut self) -> Result<String, ClientError> {
        Ok(self.command("quit").await?.text)
    }
}

/// Close a session we cannot authenticate. Any secret mismatch ends it
/// server side; under the public policy the `quit` itself does.
async fn abandon(http: &reqwest::Client, endpoint: &str, client_id: ClientId) {
    match post(http, endpoint, &RpcRequest::command(client_id, 0, "quit")).await {
        Ok(resp) if resp.is_closed() => debug!(client_id, "Abandoned session"),
        Ok(_) => warn!(client_id, "Server kept an abandoned session open"),
        Err(e) => debug!(client_id, error = %e, "Could not abandon session"),
    }
}

async fn post(
    http: &reqwest::Client,
    endpoint: &str,
    req: &RpcRequest,
) -> Result<RpcResponse, ClientError> {
    let resp = http.post(endpoint).json(req).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp.json().await?)
}
