//! Routing an authenticated request to a builtin or to the session's engine.

use crate::auth::Access;
use crate::engine::{EngineInput, IngestReport};
use crate::protocol::{Encore, RequestMode, RpcRequest, RpcResponse};
use crate::registry::ClientId;
use crate::server::{ServerCore, StopReason};
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::{debug, error};

/// Commands handled by the server itself rather than the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Quit,
    Who,
    Shutdown,
    NewLog,
}

const BUILTINS: &[(&str, Builtin, Access)] = &[
    ("quit", Builtin::Quit, Access::Read),
    ("who", Builtin::Who, Access::Write),
    ("shutdown", Builtin::Shutdown, Access::Write),
    ("newlog", Builtin::NewLog, Access::Write),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Builtin(Builtin),
    Engine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub access: Access,
    pub handler: Handler,
}

/// Verb → handler and the access it needs. Builtins shadow engine verbs.
#[derive(Debug, Clone)]
pub struct CommandTable {
    entries: HashMap<String, CommandSpec>,
}

impl CommandTable {
    pub fn new(engine_verbs: &[(&'static str, Access)]) -> Self {
        let mut entries = HashMap::new();
        for &(verb, access) in engine_verbs {
            entries.insert(
                verb.to_ascii_lowercase(),
                CommandSpec {
                    access,
                    handler: Handler::Engine,
                },
            );
        }
        for &(verb, builtin, access) in BUILTINS {
            entries.insert(
                verb.to_string(),
                CommandSpec {
                    access,
                    handler: Handler::Builtin(builtin),
                },
            );
        }
        Self { entries }
    }

    pub fn lookup(&self, verb: &str) -> Option<CommandSpec> {
        self.entries.get(&verb.to_ascii_lowercase()).copied()
    }
}

/// The caller's cap clamped to the server ceiling. Zero means unlimited.
pub fn effective_limit(requested: usize, ceiling: usize) -> usize {
    match (requested, ceiling) {
        (0, c) => c,
        (r, 0) => r,
        (r, c) => r.min(c),
    }
}

/// Cut `text` to at most `limit` bytes on a character boundary.
pub fn clamp_text(mut text: String, limit: usize) -> String {
    if limit == 0 || text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

fn denied(verb: &str) -> String {
    format!("// Sorry, {} requires write access", verb)
}

impl ServerCore {
    /// `limit` is the effective byte cap for this request; the engine sizes
    /// pages with it and [`ServerCore::handle`] enforces it on the reply.
    pub(crate) fn dispatch(&mut self, req: RpcRequest, access: Access, limit: usize) -> RpcResponse {
        let id = req.client_id;
        match req.encore {
            RequestMode::Command => self.run_command(id, &req.request, access, limit),
            RequestMode::Continue => self.run_continuation(id, access, limit),
            RequestMode::Ingest => self.run_ingest(id, &req.request, access),
        }
    }

    fn run_command(
        &mut self,
        id: ClientId,
        line: &str,
        access: Access,
        limit: usize,
    ) -> RpcResponse {
        let line = line.trim();
        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        if let Some(session) = self.registry.get_mut(id) {
            session.pending = None;
        }
        if verb.is_empty() {
            return RpcResponse::reply(id, "", Encore::Done);
        }

        let Some(spec) = self.commands.lookup(verb) else {
            return RpcResponse::reply(id, format!("// Unknown command: {}", verb), Encore::Done);
        };
        if access < spec.access {
            debug!(client_id = id, verb, "Permission denied");
            return RpcResponse::reply(id, denied(verb), Encore::Done);
        }

        debug!(client_id = id, verb, access = access.as_str(), "Dispatching");
        match spec.handler {
            Handler::Builtin(builtin) => self.run_builtin(builtin, id, args),
            Handler::Engine => self.run_engine(id, EngineInput::Command(line), access, limit),
        }
    }

    fn run_continuation(&mut self, id: ClientId, access: Access, limit: usize) -> RpcResponse {
        let pending = self.registry.get(id).and_then(|s| s.pending);
        match pending {
            Some(token) => self.run_engine(id, EngineInput::Continue(token), access, limit),
            None => RpcResponse::reply(id, "", Encore::Done),
        }
    }

    fn run_engine(
        &mut self,
        id: ClientId,
        input: EngineInput<'_>,
        access: Access,
        limit: usize,
    ) -> RpcResponse {
        let result = {
            let Some(session) = self.registry.get_mut(id) else {
                return RpcResponse::closed(crate::protocol::MSG_UNAUTHORISED);
            };
            let result = session.engine.execute(input, access, limit);
            if let Ok(output) = &result {
                session.pending = output.more;
            }
            result
        };

        match result {
            Ok(output) => {
                let encore = if output.more.is_some() {
                    Encore::More
                } else {
                    Encore::Done
                };
                RpcResponse::reply(id, output.text, encore)
            }
            Err(e) => {
                error!(client_id = id, error = %e, "Command engine failed");
                self.shutdown(StopReason::Fatal, false);
                RpcResponse::closed(format!("// {}, server stopping", e))
            }
        }
    }

    fn run_ingest(&mut self, id: ClientId, data: &str, access: Access) -> RpcResponse {
        // Ingest skips the command table, so write access is checked here.
        if access < Access::Write {
            return RpcResponse::reply(id, denied("bulk ingest"), Encore::Done);
        }

        let result = {
            let Some(session) = self.registry.get_mut(id) else {
                return RpcResponse::closed(crate::protocol::MSG_UNAUTHORISED);
            };
            session.pending = None;
            session.engine.ingest(data)
        };

        match result {
            Ok(report) => {
                debug!(client_id = id, objects = report.objects, errors = report.errors.len(), "Ingested");
                RpcResponse::reply(id, ingest_summary(&report), Encore::Done)
            }
            Err(e) => {
                error!(client_id = id, error = %e, "Bulk ingest failed");
                self.shutdown(StopReason::Fatal, false);
                RpcResponse::closed(format!("// {}, server stopping", e))
            }
        }
    }
}

fn ingest_summary(report: &IngestReport) -> String {
    let mut text = format!(
        "// {} objects read with {} errors\n",
        report.objects,
        report.errors.len()
    );
    for err in &report.errors {
        let _ = writeln!(text, "// {}", err);
    }
    text
}
