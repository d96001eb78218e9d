//! Session record persistence
//!
//! The recorder keeps the active session in a [`SessionStore`] so a restarted
//! host can resume the same replay and continue its segment numbering.

use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ReplayError, ReplayResult};
use crate::session::Session;

pub trait SessionStore: Send + Sync {
    fn read_session(&self) -> ReplayResult<Option<Session>>;

    fn write_session(&self, session: &Session) -> ReplayResult<()>;

    fn remove_session(&self) -> ReplayResult<()>;
}

/// Process-local store; the session is lost when the host exits
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn read_session(&self) -> ReplayResult<Option<Session>> {
        Ok(self.slot.lock().clone())
    }

    fn write_session(&self, session: &Session) -> ReplayResult<()> {
        *self.slot.lock() = Some(session.clone());
        Ok(())
    }

    fn remove_session(&self) -> ReplayResult<()> {
        self.slot.lock().take();
        Ok(())
    }
}

/// Stores the session record as a JSON document on disk
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn read_session(&self) -> ReplayResult<Option<Session>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let session = serde_json::from_str(&contents).map_err(|e| {
            ReplayError::Storage(format!(
                "Corrupt session file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(session))
    }

    fn write_session(&self, session: &Session) -> ReplayResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(session)?;
        fs::write(&self.path, contents)?;
        debug!("Persisted replay session {} to {}", session.id, self.path.display());
        Ok(())
    }

    fn remove_session(&self) -> ReplayResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
