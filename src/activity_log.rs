//! The server's activity log: an append-only file fed by a `tracing` layer
//! that can be reopened or redirected at runtime by `newlog`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

struct LogFile {
    path: PathBuf,
    file: File,
}

/// Shared handle to the activity log. Cloning shares the same file.
#[derive(Clone)]
pub struct ActivityLog {
    inner: Arc<Mutex<LogFile>>,
}

impl std::fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLog").field("path", &self.path()).finish()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl ActivityLog {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(LogFile { path, file })),
        })
    }

    // A panic while holding the lock leaves the file handle intact.
    fn lock(&self) -> MutexGuard<'_, LogFile> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Reopen the current path, e.g. after an external tool moved the file away.
    pub fn reopen(&self) -> io::Result<PathBuf> {
        let mut log = self.lock();
        log.file = open_append(&log.path)?;
        Ok(log.path.clone())
    }

    /// Continue logging into `name`, a plain file name in the current log's directory.
    pub fn switch_to(&self, name: &str) -> io::Result<PathBuf> {
        let plain = Path::new(name)
            .file_name()
            .is_some_and(|f| f == std::ffi::OsStr::new(name));
        if !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' is not a plain file name", name),
            ));
        }

        let mut log = self.lock();
        let path = match log.path.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        log.file = open_append(&path)?;
        log.path = path.clone();
        Ok(path)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ActivityLog {
    type Writer = ActivityLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ActivityLogWriter {
            log: self.clone(),
            buf: Vec::with_capacity(256),
        }
    }
}

/// Buffers one formatted event and appends it on drop, so events from
/// concurrent tasks never interleave.
pub struct ActivityLogWriter {
    log: ActivityLog,
    buf: Vec<u8>,
}

impl Write for ActivityLogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ActivityLogWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let mut log = self.log.lock();
        let _ = log.file.write_all(&self.buf);
        let _ = log.file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::fmt::MakeWriter;

    fn write_event(log: &ActivityLog, text: &str) {
        let mut w = log.make_writer();
        w.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn events_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        let log = ActivityLog::open(&path).unwrap();
        write_event(&log, "one\n");
        write_event(&log, "two\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn reopen_after_external_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        let log = ActivityLog::open(&path).unwrap();
        write_event(&log, "old\n");

        std::fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        assert_eq!(log.reopen().unwrap(), path);
        write_event(&log, "new\n");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.log.1")).unwrap(),
            "old\n"
        );
    }

    #[test]
    fn switch_to_stays_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::open(dir.path().join("a.log")).unwrap();

        let new_path = log.switch_to("b.log").unwrap();
        assert_eq!(new_path, dir.path().join("b.log"));
        write_event(&log, "hello\n");
        assert_eq!(std::fs::read_to_string(&new_path).unwrap(), "hello\n");

        assert!(log.switch_to("../c.log").is_err());
        assert!(log.switch_to("/tmp/c.log").is_err());
        assert_eq!(log.path(), new_path);
    }
}
