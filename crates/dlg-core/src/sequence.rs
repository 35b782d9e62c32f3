//! Crash-safe persistence of the registration token and sequence number.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use dlg_model::SequenceToken;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Token file guarded by `flock` on a `.lock` sidecar.
///
/// Writes go to a temporary file which is synced and renamed over the
/// target, so a reader sees either the old or the new content.
#[derive(Debug, Clone)]
pub struct SequenceFile {
    path: PathBuf,
}

impl SequenceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecar(&self, ext: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(ext);
        PathBuf::from(name)
    }

    fn err(&self, source: io::Error) -> CoreError {
        CoreError::Sequence {
            path: self.path.clone(),
            source,
        }
    }

    /// Current token, `None` when the file is missing or unreadable.
    pub fn read(&self) -> Result<Option<SequenceToken>, CoreError> {
        let _lock = FileLock::shared(&self.sidecar(".lock")).map_err(|e| self.err(e))?;
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.err(e)),
        };
        match raw.trim().parse::<SequenceToken>() {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring malformed sequence file");
                Ok(None)
            }
        }
    }

    pub fn write(&self, token: &SequenceToken) -> Result<(), CoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.err(e))?;
        }
        let _lock = FileLock::exclusive(&self.sidecar(".lock")).map_err(|e| self.err(e))?;

        let tmp = self.sidecar(".tmp");
        let mut f = File::create(&tmp).map_err(|e| self.err(e))?;
        f.write_all(token.to_string().as_bytes())
            .and_then(|()| f.sync_all())
            .map_err(|e| self.err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.err(e))?;

        debug!(path = %self.path.display(), sequence = ?token.sequence, "sequence file updated");
        Ok(())
    }

    /// Read the token, creating a fresh one without a sequence number if none exists.
    pub fn ensure(&self) -> Result<SequenceToken, CoreError> {
        if let Some(token) = self.read()? {
            return Ok(token);
        }
        let token = SequenceToken::new(uuid::Uuid::new_v4().to_string(), None);
        self.write(&token)?;
        Ok(token)
    }
}

/// Advisory `flock` held for the guard's lifetime.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> io::Result<Self> {
        Self::acquire(path, true)
    }

    fn shared(path: &Path) -> io::Result<Self> {
        Self::acquire(path, false)
    }

    fn acquire(path: &Path, exclusive: bool) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        flock(&file, exclusive)?;
        Ok(Self { _file: file })
    }
}

// Closing the descriptor releases the lock.
#[cfg(unix)]
fn flock(file: &File, exclusive: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let mode = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), mode) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _exclusive: bool) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let f = SequenceFile::new(dir.path().join("seq"));
        assert_eq!(f.read().unwrap(), None);
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let f = SequenceFile::new(dir.path().join("nested/seq"));
        let token = SequenceToken::new("abc", Some("5".into()));

        f.write(&token).unwrap();
        assert_eq!(f.read().unwrap(), Some(token));
        assert!(!dir.path().join("nested/seq.tmp").exists());
    }

    #[test]
    fn ensure_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let f = SequenceFile::new(dir.path().join("seq"));

        let first = f.ensure().unwrap();
        assert!(!first.token.is_empty());
        assert_eq!(first.sequence, None);
        assert_eq!(f.ensure().unwrap(), first);
    }

    #[test]
    fn garbage_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq");
        std::fs::write(&path, "not a token").unwrap();
        assert_eq!(SequenceFile::new(path).read().unwrap(), None);
    }

    #[test]
    fn concurrent_writers_leave_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq");

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let f = SequenceFile::new(path.clone());
                std::thread::spawn(move || {
                    f.write(&SequenceToken::new("tok", Some(i.to_string()))).unwrap();
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let token = SequenceFile::new(path).read().unwrap().unwrap();
        assert_eq!(token.token, "tok");
        assert!(token.sequence.is_some());
    }
}
