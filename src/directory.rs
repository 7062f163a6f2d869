//! Discovery of endpoint addresses
//!
//! Every live endpoint owns one socket file in the namespace directory, named
//! `lipcm-<name>.sock`. Scanning the directory yields a point-in-time
//! [`Directory`]; it is never updated behind the caller's back.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Prefix of every endpoint socket file
pub const SOCKET_PREFIX: &str = "lipcm-";
/// Suffix of every endpoint socket file
pub const SOCKET_SUFFIX: &str = ".sock";
/// Namespace directory used when nothing else is configured
pub const DEFAULT_NAMESPACE_DIR: &str = "/tmp";
/// Environment variable overriding the namespace directory
pub const NAMESPACE_ENV: &str = "LIPC_NAMESPACE_DIR";

// sun_path is 108 bytes including the trailing NUL
const MAX_ADDRESS_LEN: usize = 107;

/// A directory holding endpoint socket files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    dir: PathBuf,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE_DIR)
    }
}

impl Namespace {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Namespace from `LIPC_NAMESPACE_DIR`, falling back to `/tmp`
    pub fn from_env() -> Self {
        match std::env::var_os(NAMESPACE_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket address of the endpoint called `name`
    ///
    /// Fails when the name could not round-trip through a file name or the
    /// resulting path does not fit a Unix socket address.
    pub fn address_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;

        let address = self
            .dir
            .join(format!("{SOCKET_PREFIX}{name}{SOCKET_SUFFIX}"));
        if address.as_os_str().len() > MAX_ADDRESS_LEN {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: "socket path exceeds the Unix socket address limit",
            });
        }
        Ok(address)
    }

    /// Enumerate the endpoint sockets currently present
    ///
    /// A namespace directory that does not exist scans as empty.
    pub fn scan(&self) -> Result<Directory> {
        let mut entries = BTreeMap::new();

        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(dir = %self.dir.display(), "namespace directory missing");
                return Ok(Directory { entries });
            }
            Err(e) => return Err(e.into()),
        };

        for entry in read_dir {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().and_then(name_from_file) else {
                continue;
            };
            // The file may vanish between listing and stat
            match entry.file_type() {
                Ok(file_type) if file_type.is_socket() => {
                    entries.insert(name, entry.path());
                }
                _ => continue,
            }
        }

        tracing::debug!(dir = %self.dir.display(), count = entries.len(), "scanned namespace");
        Ok(Directory { entries })
    }
}

/// Function name encoded in a socket file name, if it follows the convention
pub fn name_from_file(file_name: &str) -> Option<String> {
    let name = file_name
        .strip_prefix(SOCKET_PREFIX)?
        .strip_suffix(SOCKET_SUFFIX)?;
    validate_name(name).ok()?;
    Some(name.to_string())
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(Error::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.starts_with('.') {
        return invalid("name must not start with '.'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return invalid("only ASCII letters, digits, '_', '-' and '.' are allowed");
    }
    Ok(())
}

/// One endpoint seen by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry<'a> {
    pub name: &'a str,
    pub address: &'a Path,
}

/// Snapshot of the endpoints present at scan time
///
/// An entry only records that a socket file existed; the host behind it may
/// already be gone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<String, PathBuf>,
}

impl Directory {
    pub fn address(&self, name: &str) -> Option<&Path> {
        self.entries.get(name).map(PathBuf::as_path)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Function names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = DirectoryEntry<'_>> {
        self.entries.iter().map(|(name, address)| DirectoryEntry {
            name,
            address,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
