//! The server core: all shared mutable state and the request entry point.
//!
//! Nothing in here is async. Callers serialize access (the HTTP layer holds
//! a single lock around it) and pass the current time in, which keeps the
//! timeout logic deterministic under test.

use crate::activity_log::ActivityLog;
use crate::auth::{self, AuthOutcome};
use crate::config::ServerConfig;
use crate::dispatch::{clamp_text, effective_limit, CommandTable};
use crate::engine::Database;
use crate::protocol::{RpcRequest, RpcResponse, MSG_REFUSING, MSG_UNAUTHORISED};
use crate::reaper::ReaperState;
use crate::registry::{DestroyReason, Registry};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `shutdown now`, or `shutdown` followed by the last client leaving.
    Operator,
    /// No client for longer than the server timeout.
    Idle,
    /// The database reported an unrecoverable error.
    Fatal,
    /// The process received a termination signal.
    Signal,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Operator => "operator shutdown",
            StopReason::Idle => "no clients",
            StopReason::Fatal => "fatal database error",
            StopReason::Signal => "signal",
        }
    }
}

pub struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) registry: Registry,
    pub(crate) commands: CommandTable,
    pub(crate) log: Option<ActivityLog>,
    pub(crate) refuse_new: bool,
    pub(crate) reaper: ReaperState,
    stopped: Option<StopReason>,
}

impl ServerCore {
    pub fn new(
        config: ServerConfig,
        db: Arc<dyn Database>,
        log: Option<ActivityLog>,
        now: Instant,
    ) -> Self {
        let commands = CommandTable::new(db.verbs());
        Self {
            config,
            db,
            registry: Registry::new(),
            commands,
            log,
            refuse_new: false,
            reaper: ReaperState::new(now),
            stopped: None,
        }
    }

    /// Serve one request. The reply text never exceeds the caller's cap
    /// clamped to the server ceiling.
    pub fn handle(&mut self, req: RpcRequest, now: Instant) -> RpcResponse {
        let limit = effective_limit(req.max_bytes, self.config.max_response_bytes);
        let mut resp = self.respond(req, limit, now);
        resp.text = clamp_text(resp.text, limit);
        resp
    }

    fn respond(&mut self, req: RpcRequest, limit: usize, now: Instant) -> RpcResponse {
        if self.stopped.is_some() {
            return RpcResponse::closed("// Server is shutting down");
        }
        self.registry.record_transaction();

        if req.client_id == 0 {
            return self.open_session(now);
        }

        let access = match auth::authenticate(
            &mut self.registry,
            self.config.policy,
            req.client_id,
            req.magic,
        ) {
            AuthOutcome::Granted(access) => access,
            AuthOutcome::UnknownClient | AuthOutcome::Rejected => {
                return RpcResponse::closed(MSG_UNAUTHORISED);
            }
        };

        if let Some(session) = self.registry.get_mut(req.client_id) {
            session.last_access = now;
        }
        self.dispatch(req, access, limit)
    }

    fn open_session(&mut self, now: Instant) -> RpcResponse {
        if self.refuse_new {
            info!("Refusing new session during shutdown");
            return RpcResponse::closed(MSG_REFUSING);
        }
        match self.registry.create(&self.config, self.db.as_ref(), now) {
            Ok(handshake) => {
                self.reaper.cancel_countdown();
                RpcResponse::handshake(&handshake)
            }
            Err(e) => {
                error!(error = %e, "Failed to publish session secrets");
                RpcResponse::closed(format!("// Cannot establish a session: {}", e))
            }
        }
    }

    /// Full shutdown: flush (or discard) the database and destroy every
    /// session. Idempotent.
    pub fn shutdown(&mut self, reason: StopReason, save: bool) {
        if self.stopped.is_some() {
            return;
        }
        info!(
            reason = reason.as_str(),
            save,
            active = self.registry.active_count(),
            transactions = self.registry.transactions(),
            "Shutting down"
        );
        if let Err(e) = self.db.shutdown(save) {
            error!(error = %e, "Database shutdown failed");
        }
        self.registry.destroy_all(DestroyReason::Shutdown);
        self.refuse_new = true;
        self.stopped = Some(reason);
    }

    pub fn stopped(&self) -> Option<StopReason> {
        self.stopped
    }

    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn transactions(&self) -> u64 {
        self.registry.transactions()
    }

    pub fn refuses_new(&self) -> bool {
        self.refuse_new
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Harness;
    use super::*;
    use crate::config::Policy;
    use crate::protocol::{Encore, MSG_WELCOME};

    #[test]
    fn handshake_issues_fresh_ids() {
        let mut h = Harness::new(Policy::DirectorySecret);
        let a = h.connect();
        let b = h.connect();
        assert!(a.id > 0 && b.id > a.id);
        assert_ne!(a.write, 0);
        assert_ne!(a.read, 0);
        assert_eq!(h.core.active_count(), 2);
    }

    #[test]
    fn handshake_response_carries_hints() {
        let mut h = Harness::new(Policy::Public);
        let resp = h.core.handle(RpcRequest::hello(), h.start);
        assert_eq!(resp.text, MSG_WELCOME);
        assert!(resp.magic > 0);
        assert_eq!(resp.read_secret.as_deref(), Some(crate::secret::PUBLIC));
        assert!(resp.write_secret.unwrap().starts_with(h.wdir.path().to_str().unwrap()));
    }

    #[test]
    fn bad_secret_closes_session_for_good() {
        let mut h = Harness::new(Policy::DirectorySecret);
        let c = h.connect();
        let bogus = c.write ^ c.read ^ 0x55;

        let resp = h.send(c, bogus, "count");
        assert!(resp.is_closed());
        assert_eq!(resp.text, MSG_UNAUTHORISED);

        let resp = h.send(c, c.write, "count");
        assert!(resp.is_closed());
        assert_eq!(h.core.active_count(), 0);
        assert_eq!(std::fs::read_dir(h.wdir.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(h.rdir.path()).unwrap().count(), 0);
    }

    #[test]
    fn every_request_counts_as_a_transaction() {
        let mut h = Harness::new(Policy::Public);
        let c = h.connect();
        h.send(c, 0, "count");
        h.send(c, 0, "nonsense-verb");
        h.core.handle(RpcRequest::command(999, 0, "count"), h.start);
        assert_eq!(h.core.transactions(), 4);
    }

    #[test]
    fn requests_refresh_last_access() {
        let mut h = Harness::new(Policy::Public);
        let c = h.connect();
        let later = h.start + std::time::Duration::from_secs(30);
        h.core.handle(RpcRequest::command(c.id, 0, "count"), later);
        assert_eq!(h.core.registry().get(c.id).unwrap().last_access, later);
    }

    #[test]
    fn refuse_new_blocks_handshake_only() {
        let mut h = Harness::new(Policy::Public);
        let c = h.connect();
        h.core.refuse_new = true;

        let resp = h.core.handle(RpcRequest::hello(), h.start);
        assert!(resp.is_closed());
        assert_eq!(resp.text, MSG_REFUSING);

        let resp = h.send(c, 0, "count");
        assert_eq!(resp.client_id, c.id);
        assert_eq!(resp.encore, Encore::Done);
    }

    #[test]
    fn shutdown_destroys_everything_once() {
        let mut h = Harness::new(Policy::Public);
        h.connect();
        h.connect();
        h.core.shutdown(StopReason::Operator, true);
        h.core.shutdown(StopReason::Idle, true);
        assert_eq!(h.core.stopped(), Some(StopReason::Operator));
        assert_eq!(h.core.active_count(), 0);
        assert!(h.core.handle(RpcRequest::hello(), h.start).is_closed());
    }
}
