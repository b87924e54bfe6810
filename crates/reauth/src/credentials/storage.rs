//! Durable backings for the [`CredentialStore`](super::CredentialStore).
use std::{
    fmt::Debug,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use super::StoredCredentials;
use crate::error::{Error, Result};

/// A single durable entry holding the current user's credential record.
///
/// Implementations may block. Renewal outcomes are persisted from
/// `tokio::task::spawn_blocking`, never on an async worker.
pub trait CredentialStorage: Debug + Send + Sync {
    /// Loads the record, `None` if nothing is stored.
    ///
    /// # Errors
    /// Fails if the entry exists but cannot be read or parsed.
    fn load(&self) -> Result<Option<StoredCredentials>>;

    /// Stores `record`, replacing any previous one.
    ///
    /// # Errors
    /// Fails if the record cannot be written.
    fn save(&self, record: &StoredCredentials) -> Result<()>;

    /// Removes the record. Removing an absent record succeeds.
    ///
    /// # Errors
    /// Fails if an existing record cannot be removed.
    fn remove(&self) -> Result<()>;
}

/// Stores the credential record as a JSON file.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the target, so a crash never leaves a half-written record behind.
/// On unix the file is created with mode `0600`.
#[derive(Debug, Clone)]
pub struct FileCredentialStorage {
    path: PathBuf,
}

impl FileCredentialStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStorage for FileCredentialStorage {
    fn load(&self) -> Result<Option<StoredCredentials>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "reading `{}`: {e}",
                    self.path.display()
                )))
            }
        };

        serde_json::from_str(&contents).map(Some).map_err(|e| {
            Error::Persistence(format!("parsing `{}`: {e}", self.path.display()))
        })
    }

    fn save(&self, record: &StoredCredentials) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::Persistence(format!("serializing credentials: {e}")))?;

        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

        write_private(&tmp_path, &json).map_err(|e| {
            Error::Persistence(format!("writing `{}`: {e}", tmp_path.display()))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            Error::Persistence(format!("replacing `{}`: {e}", self.path.display()))
        })?;

        tracing::trace!(path = %self.path.display(), "Persisted credentials");
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence(format!(
                "removing `{}`: {e}",
                self.path.display()
            ))),
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::{io::Write, os::unix::fs::OpenOptionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Keeps the record in memory only. Clones share the same entry.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStorage {
    record: Arc<Mutex<Option<StoredCredentials>>>,
}

impl MemoryCredentialStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_record(record: StoredCredentials) -> Self {
        Self {
            record: Arc::new(Mutex::new(Some(record))),
        }
    }

    /// The currently stored record.
    #[must_use]
    pub fn record(&self) -> Option<StoredCredentials> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CredentialStorage for MemoryCredentialStorage {
    fn load(&self) -> Result<Option<StoredCredentials>> {
        Ok(self.record())
    }

    fn save(&self, record: &StoredCredentials) -> Result<()> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::credentials::{CredentialPair, CredentialStore, RecordShape};

    #[test]
    fn test_missing_file_loads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileCredentialStorage::new(dir.path().join("session.json"));
        assert!(storage.load().unwrap().is_none());
        storage.remove().unwrap();
    }

    #[test]
    fn test_nested_record_survives_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let original = json!({
            "data": {"accessToken": "T1", "refreshToken": "RT1"},
            "user": {"name": "Jo"}
        });
        std::fs::write(&path, original.to_string()).unwrap();

        let store = CredentialStore::open(FileCredentialStorage::new(&path));
        assert_eq!(store.read(), Some(CredentialPair::new("T1", "RT1")));
        store.replace(&CredentialPair::new("T2", "RT2")).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            written,
            json!({
                "data": {"accessToken": "T2", "refreshToken": "RT2"},
                "user": {"name": "Jo"}
            })
        );

        let reopened = FileCredentialStorage::new(&path).load().unwrap().unwrap();
        assert_eq!(reopened.shape(), RecordShape::Nested);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = CredentialStore::open(FileCredentialStorage::new(&path));
        store.replace(&CredentialPair::new("T1", "RT1")).unwrap();
        assert!(path.exists());

        store.clear().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let storage = FileCredentialStorage::new(&path);
        assert!(matches!(storage.load(), Err(Error::Persistence(_))));
        assert_eq!(CredentialStore::open(storage).read(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        FileCredentialStorage::new(&path)
            .save(&StoredCredentials::new(&CredentialPair::new("T1", "RT1")))
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
