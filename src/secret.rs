//! Secret derivation and out-of-band publication.
//!
//! A new session gets a public `client_magic` over the RPC channel. The
//! secrets a client must present afterwards are derived from it and written
//! to files in the configured access directories, so only a client that can
//! also read those directories is able to authenticate.

use crate::config::{Policy, ServerConfig};
use crate::registry::ClientId;
use rand::Rng;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Raw draws are reduced below this bound (2^31 - 1).
const DRAW_MODULUS: u64 = 0x7fff_ffff;
pub const READ_MODULUS: u64 = 73_256_171;
pub const WRITE_MODULUS: u64 = 43_532_334;

pub const NON_WRITABLE: &str = "NON_WRITABLE";
pub const PUBLIC: &str = "PUBLIC";
pub const RESTRICTED: &str = "RESTRICTED";

/// Values derived for one session. A zero secret means that tier is not
/// attainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Secrets {
    pub client_magic: u64,
    pub read: u64,
    pub write: u64,
}

impl Secrets {
    /// Draw fresh secrets for a session.
    pub fn derive(write_enabled: bool, publish_read: bool) -> Self {
        let mut rng = rand::thread_rng();
        Self::derive_with(|| rng.gen_range(1..DRAW_MODULUS), write_enabled, publish_read)
    }

    /// `draw` yields values in `1..DRAW_MODULUS`. The read secret never
    /// equals the write secret, otherwise a read-only holder would pass the
    /// write check.
    fn derive_with(mut draw: impl FnMut() -> u64, write_enabled: bool, publish_read: bool) -> Self {
        let m1 = draw();
        let write = if write_enabled {
            nonzero_product(&mut draw, m1, WRITE_MODULUS)
        } else {
            0
        };
        let read = if publish_read {
            loop {
                let read = nonzero_product(&mut draw, m1, READ_MODULUS);
                if read != write {
                    break read;
                }
            }
        } else {
            0
        };
        Self {
            client_magic: m1,
            read,
            write,
        }
    }
}

fn nonzero_product(draw: &mut impl FnMut() -> u64, m1: u64, modulus: u64) -> u64 {
    loop {
        let v = (m1 * draw()) % modulus;
        if v != 0 {
            return v;
        }
    }
}

/// What the client is told about where to find a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretHint {
    File(PathBuf),
    Sentinel(&'static str),
}

impl SecretHint {
    pub fn to_wire(&self) -> String {
        match self {
            SecretHint::File(path) => path.display().to_string(),
            SecretHint::Sentinel(s) => (*s).to_string(),
        }
    }
}

/// Secret files owned by one session. Dropping the value deletes the files.
#[derive(Debug, Default)]
pub struct SecretFiles {
    paths: Vec<PathBuf>,
}

impl SecretFiles {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Delete every published file. Safe to call more than once.
    pub fn remove(&mut self) {
        for path in self.paths.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed secret file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove secret file"),
            }
        }
    }
}

impl Drop for SecretFiles {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Result of publishing a session's secrets.
#[derive(Debug)]
pub struct Publication {
    pub files: SecretFiles,
    pub write_hint: SecretHint,
    pub read_hint: SecretHint,
}

/// File name used for a client's secret in either access directory.
pub fn secret_file_name(client_id: ClientId) -> String {
    format!("acesrv-{}-{}", std::process::id(), client_id)
}

/// Write the derived secrets to the access directories.
///
/// On error any file already written is removed again.
pub fn publish(
    config: &ServerConfig,
    client_id: ClientId,
    secrets: &Secrets,
) -> io::Result<Publication> {
    let mut files = SecretFiles::default();
    let name = secret_file_name(client_id);

    let write_hint = match &config.write_dir {
        Some(dir) if secrets.write != 0 => {
            let path = write_secret_file(dir, &name, secrets.write)?;
            files.paths.push(path.clone());
            SecretHint::File(path)
        }
        _ => SecretHint::Sentinel(NON_WRITABLE),
    };

    let read_hint = match config.policy {
        Policy::Public => SecretHint::Sentinel(PUBLIC),
        Policy::Restricted => SecretHint::Sentinel(RESTRICTED),
        Policy::DirectorySecret => match &config.read_dir {
            Some(dir) if secrets.read != 0 => {
                // `files` cleans up the write file if this fails.
                let path = write_secret_file(dir, &name, secrets.read)?;
                files.paths.push(path.clone());
                SecretHint::File(path)
            }
            _ => SecretHint::Sentinel(RESTRICTED),
        },
    };

    Ok(Publication {
        files,
        write_hint,
        read_hint,
    })
}

fn write_secret_file(dir: &Path, name: &str, secret: u64) -> io::Result<PathBuf> {
    let path = dir.join(name);
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o640);
    }
    let mut file = options.open(&path)?;
    writeln!(file, "{}", secret)?;
    file.sync_all()?;
    Ok(path)
}

/// Parse the contents of a secret file.
pub fn parse_secret(contents: &str) -> Option<u64> {
    contents.trim().parse().ok()
}
