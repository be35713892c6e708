//! Per-request authentication against the session registry.

use crate::config::Policy;
use crate::registry::{ClientId, DestroyReason, Registry};
use tracing::warn;

/// Access tier granted to one request. `Write` implies read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted(Access),
    /// No session with that id. Nothing is created implicitly.
    UnknownClient,
    /// Wrong secret. The session has already been destroyed.
    Rejected,
}

/// Check a `(client_id, magic)` pair and decide the tier for this request.
///
/// Access is evaluated afresh on every call; a session that presented the
/// write secret earlier gets nothing extra from it now.
pub fn authenticate(
    registry: &mut Registry,
    policy: Policy,
    client_id: ClientId,
    magic: u64,
) -> AuthOutcome {
    let Some(session) = registry.get_mut(client_id) else {
        warn!(client_id, "Request for unknown session");
        return AuthOutcome::UnknownClient;
    };

    let secrets = session.secrets;
    let access = if secrets.write != 0 && magic == secrets.write {
        Some(Access::Write)
    } else if policy == Policy::DirectorySecret && secrets.read != 0 && magic == secrets.read {
        Some(Access::Read)
    } else if policy == Policy::Public {
        Some(Access::Read)
    } else {
        None
    };

    match access {
        Some(access) => {
            session.granted_write = access == Access::Write;
            AuthOutcome::Granted(access)
        }
        None => {
            warn!(client_id, "Secret mismatch, closing session");
            registry.destroy(client_id, DestroyReason::AuthFailure);
            AuthOutcome::Rejected
        }
    }
}
