//! Small in-memory object store behind the command engine seam.
//!
//! Objects are `(class, name)` pairs carrying free text lines. Each session
//! gets its own [`MemEngine`] with a private active set and pager; the
//! object table itself is shared.

use crate::auth::Access;
use crate::engine::{
    CommandEngine, Continuation, Database, EngineInput, EngineOutput, IngestReport,
};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Entries per page when the caller gives no `-c`.
pub const DEFAULT_PAGE: usize = 20;

const VERBS: &[(&str, Access)] = &[
    ("help", Access::Read),
    ("classes", Access::Read),
    ("find", Access::Read),
    ("count", Access::Read),
    ("list", Access::Read),
    ("show", Access::Read),
    ("kill", Access::Write),
    ("save", Access::Write),
];

type ObjectKey = (String, String);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Store {
    classes: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl Store {
    fn len(&self) -> usize {
        self.classes.values().map(BTreeMap::len).sum()
    }
}

#[derive(Debug, Default)]
struct Inner {
    store: Store,
    dirty: bool,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    data_file: Option<PathBuf>,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, EngineError> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Fatal("object store lock poisoned".to_string()))
    }

    fn save_if_dirty(&self) -> Result<bool, EngineError> {
        let mut inner = self.lock()?;
        if !inner.dirty {
            return Ok(false);
        }
        if let Some(path) = &self.data_file {
            write_atomically(path, &serde_json::to_vec_pretty(&inner.store)?)?;
            info!(path = %path.display(), objects = inner.store.len(), "Saved object store");
        }
        inner.dirty = false;
        Ok(true)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// The shared object store.
#[derive(Debug, Clone)]
pub struct MemStore {
    shared: Arc<Shared>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// A store that lives only in memory.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                data_file: None,
            }),
        }
    }

    /// A store persisted to `path` as JSON, loaded now if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let store = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Store::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), objects = store.len(), "Opened object store");
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    store,
                    dirty: false,
                }),
                data_file: Some(path),
            }),
        })
    }

    pub fn object_count(&self) -> Result<usize, EngineError> {
        Ok(self.shared.lock()?.store.len())
    }

    pub fn is_dirty(&self) -> Result<bool, EngineError> {
        Ok(self.shared.lock()?.dirty)
    }
}

impl Database for MemStore {
    fn verbs(&self) -> &[(&'static str, Access)] {
        VERBS
    }

    fn open_engine(&self) -> Box<dyn CommandEngine> {
        Box::new(MemEngine::new(Arc::clone(&self.shared)))
    }

    fn save_if_dirty(&self) -> Result<bool, EngineError> {
        self.shared.save_if_dirty()
    }

    fn shutdown(&self, save: bool) -> Result<(), EngineError> {
        if save {
            self.shared.save_if_dirty()?;
        } else {
            let mut inner = self.shared.lock()?;
            if inner.dirty {
                info!("Discarding unsaved changes");
            }
            inner.dirty = false;
        }
        Ok(())
    }
}

struct Pager {
    token: Continuation,
    chunks: Vec<String>,
    offset: usize,
    page: usize,
}

/// One session's view of the store.
pub struct MemEngine {
    shared: Arc<Shared>,
    active: Vec<ObjectKey>,
    pager: Option<Pager>,
    next_token: u64,
}

impl MemEngine {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            active: Vec::new(),
            pager: None,
            next_token: 1,
        }
    }

    fn run(&mut self, line: &str, access: Access, limit: usize) -> Result<EngineOutput, EngineError> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or("").to_ascii_lowercase();
        let args: Vec<&str> = words.collect();
        self.pager = None;

        match verb.as_str() {
            "help" => Ok(EngineOutput::done(help_text())),
            "classes" => self.classes(),
            "find" => self.find(&args),
            "count" => Ok(EngineOutput::done(format!(
                "// {} objects in active set",
                self.active.len()
            ))),
            "list" => {
                let page = page_size(&args);
                let chunks = self
                    .active
                    .iter()
                    .map(|(class, name)| format!("{} : \"{}\"\n", class, name))
                    .collect();
                Ok(self.paginate(chunks, page, limit))
            }
            "show" => {
                let page = page_size(&args);
                let chunks = self.render_active()?;
                Ok(self.paginate(chunks, page, limit))
            }
            "kill" if access == Access::Write => self.kill(),
            "kill" => Ok(EngineOutput::done("// Sorry, kill requires write access")),
            "save" => match self.shared.save_if_dirty() {
                Ok(true) => Ok(EngineOutput::done("// Saved")),
                Ok(false) => Ok(EngineOutput::done("// Nothing to save")),
                Err(EngineError::Fatal(msg)) => Err(EngineError::Fatal(msg)),
                Err(e) => Ok(EngineOutput::done(format!("// Save failed: {}", e))),
            },
            other => Ok(EngineOutput::done(format!("// Unknown command: {}", other))),
        }
    }

    fn classes(&self) -> Result<EngineOutput, EngineError> {
        let inner = self.shared.lock()?;
        let mut text = String::new();
        for (class, objects) in &inner.store.classes {
            let _ = writeln!(text, "{} {}", class, objects.len());
        }
        if text.is_empty() {
            text.push_str("// No classes\n");
        }
        Ok(EngineOutput::done(text))
    }

    fn find(&mut self, args: &[&str]) -> Result<EngineOutput, EngineError> {
        let Some(class) = args.first() else {
            return Ok(EngineOutput::done("// Usage: find <class> [pattern]"));
        };
        let pattern = args.get(1).copied().unwrap_or("*");

        let inner = self.shared.lock()?;
        self.active = inner
            .store
            .classes
            .iter()
            .filter(|(c, _)| c.eq_ignore_ascii_case(class))
            .flat_map(|(c, objects)| {
                objects
                    .keys()
                    .filter(|name| glob_match(pattern, name))
                    .map(move |name| (c.clone(), name.clone()))
            })
            .collect();
        Ok(EngineOutput::done(format!(
            "// Found {} objects",
            self.active.len()
        )))
    }

    fn render_active(&self) -> Result<Vec<String>, EngineError> {
        let inner = self.shared.lock()?;
        let chunks = self
            .active
            .iter()
            .filter_map(|(class, name)| {
                let lines = inner.store.classes.get(class)?.get(name)?;
                let mut chunk = format!("{} : \"{}\"\n", class, name);
                for line in lines {
                    chunk.push_str(line);
                    chunk.push('\n');
                }
                chunk.push('\n');
                Some(chunk)
            })
            .collect();
        Ok(chunks)
    }

    fn kill(&mut self) -> Result<EngineOutput, EngineError> {
        let mut inner = self.shared.lock()?;
        let mut killed = 0;
        for (class, name) in self.active.drain(..) {
            if let Some(objects) = inner.store.classes.get_mut(&class) {
                if objects.remove(&name).is_some() {
                    killed += 1;
                }
                if objects.is_empty() {
                    inner.store.classes.remove(&class);
                }
            }
        }
        if killed > 0 {
            inner.dirty = true;
        }
        Ok(EngineOutput::done(format!("// {} objects killed", killed)))
    }

    fn paginate(&mut self, chunks: Vec<String>, page: usize, limit: usize) -> EngineOutput {
        let pager = Pager {
            token: Continuation(self.next_token),
            chunks,
            offset: 0,
            page,
        };
        self.next_token += 1;
        self.pager = Some(pager);
        self.next_page(limit)
    }

    fn next_page(&mut self, limit: usize) -> EngineOutput {
        let Some(pager) = self.pager.as_mut() else {
            return EngineOutput::done("");
        };

        let mut text = String::new();
        let mut taken = 0;
        for chunk in &pager.chunks[pager.offset..] {
            if taken == pager.page {
                break;
            }
            // Always emit at least one chunk so the pager makes progress.
            if taken > 0 && limit > 0 && text.len() + chunk.len() > limit {
                break;
            }
            text.push_str(chunk);
            taken += 1;
        }
        pager.offset += taken;

        if pager.offset < pager.chunks.len() {
            let token = pager.token;
            debug!(remaining = pager.chunks.len() - pager.offset, "More output pending");
            EngineOutput::more(text, token)
        } else {
            self.pager = None;
            EngineOutput::done(text)
        }
    }
}

impl CommandEngine for MemEngine {
    fn execute(
        &mut self,
        input: EngineInput<'_>,
        access: Access,
        limit: usize,
    ) -> Result<EngineOutput, EngineError> {
        match input {
            EngineInput::Command(line) => self.run(line, access, limit),
            EngineInput::Continue(token) => match &self.pager {
                Some(pager) if pager.token == token => Ok(self.next_page(limit)),
                _ => Ok(EngineOutput::done("// Nothing more to show")),
            },
        }
    }

    fn ingest(&mut self, text: &str) -> Result<IngestReport, EngineError> {
        let mut report = IngestReport::default();
        let mut parsed: Vec<(ObjectKey, Vec<String>)> = Vec::new();

        for (line_no, paragraph) in paragraphs(text) {
            let header = paragraph[0];
            match parse_header(header) {
                Some(key) => {
                    let body = paragraph[1..].iter().map(|l| l.to_string()).collect();
                    parsed.push((key, body));
                }
                None => report
                    .errors
                    .push(format!("line {}: cannot parse object header '{}'", line_no, header)),
            }
        }

        if !parsed.is_empty() {
            let mut inner = self.shared.lock()?;
            for ((class, name), body) in parsed {
                inner
                    .store
                    .classes
                    .entry(class)
                    .or_default()
                    .entry(name)
                    .or_default()
                    .extend(body);
                report.objects += 1;
            }
            inner.dirty = true;
        }
        Ok(report)
    }
}

fn help_text() -> String {
    let mut text = String::from("// Commands:\n");
    for (verb, access) in VERBS {
        let _ = writeln!(text, "//   {:<8} ({})", verb, access.as_str());
    }
    text
}

fn page_size(args: &[&str]) -> usize {
    match args {
        ["-c", n, ..] => n.parse().ok().filter(|&n| n > 0).unwrap_or(DEFAULT_PAGE),
        _ => DEFAULT_PAGE,
    }
}

/// Blank-line separated paragraphs with the 1-based line number of their first line.
fn paragraphs(text: &str) -> Vec<(usize, Vec<&str>)> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start = 0;
    for (i, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.trim_start().starts_with("//") {
            if line.trim().is_empty() && !current.is_empty() {
                out.push((start, std::mem::take(&mut current)));
            }
            continue;
        }
        if current.is_empty() {
            start = i + 1;
        }
        current.push(line);
    }
    if !current.is_empty() {
        out.push((start, current));
    }
    out
}

/// `Class : "Name"`, `Class : Name` or `Class Name`.
fn parse_header(line: &str) -> Option<ObjectKey> {
    let (class, name) = match line.split_once(':') {
        Some((class, name)) => (class.trim(), name.trim()),
        None => line.trim().split_once(char::is_whitespace)?,
    };
    let name = name.trim().trim_matches('"');
    let valid_class = !class.is_empty()
        && class.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_class || name.is_empty() {
        return None;
    }
    Some((class.to_string(), name.to_string()))
}

/// Case-insensitive match with `*` and `?` wildcards.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
