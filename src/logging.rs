//! Per-endpoint log files
//!
//! When an endpoint is given a log directory, its accept loop and workers
//! install a thread-default [`Dispatch`] that writes `tracing` events to
//! `<dir>/log_<name>.log`. The file is rotated by size, keeping a fixed number
//! of numbered backups (`log_<name>.log.1` is the newest).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::EndpointOptions;

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 5;

/// Build the log dispatcher of one endpoint, if it has a log directory
pub(crate) fn endpoint_dispatch(
    name: &str,
    options: &EndpointOptions,
) -> io::Result<Option<Dispatch>> {
    let Some(dir) = options.log_dir() else {
        return Ok(None);
    };

    let file = RotatingFile::open(
        dir.join(format!("log_{name}.log")),
        options.log_max_bytes(),
        options.log_max_files(),
    )?;

    let subscriber = tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .with_thread_names(true)
        .with_max_level(options.log_level())
        .finish();

    Ok(Some(Dispatch::new(subscriber)))
}

struct FileState {
    file: File,
    written: u64,
}

/// Append-only log file that rotates once it would exceed `max_bytes`
///
/// With `max_files == 0` the file is truncated instead of rotated.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    state: Mutex<FileState>,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>, max_bytes: u64, max_files: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            max_files,
            state: Mutex::new(FileState { file, written }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(format!(".{index}"));
        PathBuf::from(path)
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_record(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();

        let incoming = buf.len() as u64;
        if self.max_bytes > 0 && state.written > 0 && state.written + incoming > self.max_bytes {
            self.rotate(&mut state)?;
        }

        state.file.write_all(buf)?;
        state.written += incoming;
        Ok(buf.len())
    }

    fn rotate(&self, state: &mut FileState) -> io::Result<()> {
        state.file.flush()?;

        if self.max_files > 0 {
            for index in (1..self.max_files).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    std::fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            std::fs::rename(&self.path, self.backup_path(1))?;
        }

        state.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        state.written = 0;
        Ok(())
    }
}

/// Writer handed to the formatter for a single event
pub struct RotatingWriter<'a> {
    file: &'a RotatingFile,
}

impl Write for RotatingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = RotatingWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriter { file: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_rotation_caps_backups() {
        let dir = tempfile::tempdir().unwrap();
        let log = RotatingFile::open(dir.path().join("log_f.log"), 100, 2).unwrap();

        let record = [b'x'; 60];
        for _ in 0..10 {
            log.make_writer().write_all(&record).unwrap();
        }

        assert!(dir.path().join("log_f.log").exists());
        assert!(dir.path().join("log_f.log.1").exists());
        assert!(dir.path().join("log_f.log.2").exists());
        assert!(!dir.path().join("log_f.log.3").exists());

        for name in ["log_f.log", "log_f.log.1", "log_f.log.2"] {
            let len = std::fs::metadata(dir.path().join(name)).unwrap().len();
            assert!(len <= 100, "{name} grew to {len} bytes");
        }
    }

    #[test]
    fn test_zero_backups_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log = RotatingFile::open(dir.path().join("log_g.log"), 50, 0).unwrap();

        for _ in 0..5 {
            log.make_writer().write_all(&[b'y'; 30]).unwrap();
        }

        assert!(!dir.path().join("log_g.log.1").exists());
        assert_eq!(std::fs::metadata(log.path()).unwrap().len(), 30);
    }

    #[test]
    fn test_endpoint_dispatch_filters_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let options = EndpointOptions::builder()
            .log_dir(dir.path())
            .log_level(LevelFilter::INFO)
            .build();

        let dispatch = endpoint_dispatch("square", &options).unwrap().unwrap();
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(n = 4, "square called");
            tracing::debug!("not recorded");
        });

        let contents = std::fs::read_to_string(dir.path().join("log_square.log")).unwrap();
        assert!(contents.contains("square called"));
        assert!(contents.contains("n=4"));
        assert!(!contents.contains("not recorded"));
    }

    #[test]
    fn test_no_log_dir_means_no_dispatch() {
        let options = EndpointOptions::default();
        assert!(endpoint_dispatch("square", &options).unwrap().is_none());
    }
}
