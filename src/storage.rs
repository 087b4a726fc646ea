use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::passid::PassId;

/// Boxed error for consumer-provided seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Local persistent storage for the current pass id.
///
/// A single key holding a plain string, no structured envelope. Absence
/// is a valid, expected state (first visit, or storage disabled). The
/// gate is the only writer; failures flip it into memory-only operation
/// for the rest of the session instead of propagating.
pub trait TokenStore: Send + Sync {
    /// Read the stored token, if any.
    fn load(&self) -> Result<Option<PassId>, BoxError>;

    /// Overwrite the stored token.
    fn save(&self, id: &PassId) -> Result<(), BoxError>;
}

impl<T: TokenStore + ?Sized> TokenStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Option<PassId>, BoxError> {
        (**self).load()
    }

    fn save(&self, id: &PassId) -> Result<(), BoxError> {
        (**self).save(id)
    }
}

/// In-memory store. Used in tests and wherever persistence across
/// restarts is not wanted.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<PassId>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing token.
    #[must_use]
    pub fn with_token(id: PassId) -> Self {
        Self {
            slot: Mutex::new(Some(id)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<PassId>, BoxError> {
        Ok(self.slot.lock().expect("token slot lock poisoned").clone())
    }

    fn save(&self, id: &PassId) -> Result<(), BoxError> {
        *self.slot.lock().expect("token slot lock poisoned") = Some(id.clone());
        Ok(())
    }
}

/// File-backed store: one file, one line, the token.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Store the token in `dir/key`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>, key: &str) -> Self {
        Self {
            path: dir.as_ref().join(key),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<PassId>, BoxError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(PassId::from(trimmed)))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, id: &PassId) -> Result<(), BoxError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, id.as_str())?;
        Ok(())
    }
}
