//! The seam between the server envelope and the database it fronts.
//!
//! The server never interprets the query language. It hands a command line
//! (or a continuation token, or a bulk-ingest payload) to a per-session
//! [`CommandEngine`] together with the access level the request was granted,
//! and returns whatever text comes back.

use crate::auth::Access;
use crate::error::EngineError;

/// Opaque token naming a command that still has output to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Continuation(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineInput<'a> {
    Command(&'a str),
    Continue(Continuation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub text: String,
    /// Set when the command has further output pending.
    pub more: Option<Continuation>,
}

impl EngineOutput {
    pub fn done(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            more: None,
        }
    }

    pub fn more(text: impl Into<String>, token: Continuation) -> Self {
        Self {
            text: text.into(),
            more: Some(token),
        }
    }
}

/// Outcome of a bulk ingest: objects stored plus one line per rejected paragraph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub objects: usize,
    pub errors: Vec<String>,
}

/// One session's handle onto the database. Created with the session and
/// dropped when the session is destroyed.
pub trait CommandEngine: Send {
    /// Run a command or continue a paginated one.
    ///
    /// `limit` is the effective response ceiling in bytes (zero = none); an
    /// engine may use it to size pages. An `Err` means the database is no
    /// longer usable.
    fn execute(
        &mut self,
        input: EngineInput<'_>,
        access: Access,
        limit: usize,
    ) -> Result<EngineOutput, EngineError>;

    /// Load a batch of data definitions.
    fn ingest(&mut self, text: &str) -> Result<IngestReport, EngineError>;
}

/// The database shared by all sessions.
pub trait Database: Send + Sync {
    /// Command verbs the engine accepts, with the access each one needs.
    fn verbs(&self) -> &[(&'static str, Access)];

    fn open_engine(&self) -> Box<dyn CommandEngine>;

    /// Persist outstanding changes. Returns whether anything was written.
    fn save_if_dirty(&self) -> Result<bool, EngineError>;

    /// Final flush before the process exits. With `save == false` outstanding
    /// changes are discarded.
    fn shutdown(&self, save: bool) -> Result<(), EngineError>;
}
