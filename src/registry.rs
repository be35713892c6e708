//! Live sessions, keyed by client id.

use crate::config::ServerConfig;
use crate::engine::{CommandEngine, Continuation, Database};
use crate::secret::{self, SecretFiles, SecretHint, Secrets};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

/// Client ids are positive; zero on the wire means "no session".
pub type ClientId = u64;

/// Server-side state for one client.
pub struct Session {
    pub id: ClientId,
    pub secrets: Secrets,
    /// True only while the latest authenticated request presented the write secret.
    pub granted_write: bool,
    pub created_at: Instant,
    pub last_access: Instant,
    pub pending: Option<Continuation>,
    pub engine: Box<dyn CommandEngine>,
    pub files: SecretFiles,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("granted_write", &self.granted_write)
            .field("last_access", &self.last_access)
            .field("pending", &self.pending)
            .field("files", &self.files.paths())
            .finish_non_exhaustive()
    }
}

/// Why a session went away. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Quit,
    AuthFailure,
    Idle,
    Shutdown,
}

impl DestroyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestroyReason::Quit => "quit",
            DestroyReason::AuthFailure => "authentication failure",
            DestroyReason::Idle => "idle timeout",
            DestroyReason::Shutdown => "server shutdown",
        }
    }
}

/// What a newly created session is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub client_id: ClientId,
    pub client_magic: u64,
    pub write_hint: SecretHint,
    pub read_hint: SecretHint,
}

#[derive(Debug)]
pub struct Registry {
    sessions: HashMap<ClientId, Session>,
    next_id: ClientId,
    transactions: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            transactions: 0,
        }
    }

    /// Create a session: issue an id, derive and publish its secrets, and
    /// open its command engine.
    pub fn create(
        &mut self,
        config: &ServerConfig,
        db: &dyn Database,
        now: Instant,
    ) -> std::io::Result<Handshake> {
        let id = self.next_id;
        self.next_id += 1;

        let secrets = Secrets::derive(
            config.write_enabled(),
            config.policy.publishes_read_secret(),
        );
        let publication = secret::publish(config, id, &secrets)?;

        let session = Session {
            id,
            secrets,
            granted_write: false,
            created_at: now,
            last_access: now,
            pending: None,
            engine: db.open_engine(),
            files: publication.files,
        };
        self.sessions.insert(id, session);
        info!(client_id = id, active = self.sessions.len(), "Created session");

        Ok(Handshake {
            client_id: id,
            client_magic: secrets.client_magic,
            write_hint: publication.write_hint,
            read_hint: publication.read_hint,
        })
    }

    pub fn get(&self, id: ClientId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Remove a session, delete its secret files and release its engine.
    pub fn destroy(&mut self, id: ClientId, reason: DestroyReason) -> bool {
        match self.sessions.remove(&id) {
            Some(mut session) => {
                session.files.remove();
                info!(
                    client_id = id,
                    reason = reason.as_str(),
                    active = self.sessions.len(),
                    "Destroyed session"
                );
                true
            }
            None => false,
        }
    }

    pub fn destroy_all(&mut self, reason: DestroyReason) {
        let ids: Vec<ClientId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.destroy(id, reason);
        }
    }

    /// Sessions whose last request is strictly older than `timeout`.
    pub fn idle_sessions(&self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        self.sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_access) > timeout)
            .map(|s| s.id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn record_transaction(&mut self) {
        self.transactions += 1;
    }

    pub fn transactions(&self) -> u64 {
        self.transactions
    }
}
