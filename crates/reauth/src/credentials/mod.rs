mod storage;

use std::{
    fmt,
    sync::{Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
pub use storage::*;

use crate::error::Result;

const ACCESS_TOKEN: &str = "accessToken";
const REFRESH_TOKEN: &str = "refreshToken";
const DATA: &str = "data";

/// An access / refresh token pair.
///
/// Always replaced as a whole: the store never hands out an access token
/// together with a refresh token from a different pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, veil::Redact)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    #[redact]
    access_token: String,
    #[redact]
    refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

/// Layout of the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordShape {
    /// `{"accessToken": .., "refreshToken": .., ...}`
    #[default]
    Flat,
    /// `{"data": {"accessToken": .., "refreshToken": .., ...}, ...}`
    Nested,
}

/// The persisted credential record.
///
/// Keeps the record's shape and every field unrelated to the tokens, so that
/// replacing the pair writes back everything else untouched.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct StoredCredentials {
    shape: RecordShape,
    record: Map<String, Value>,
}

impl StoredCredentials {
    /// A flat record holding only `pair`.
    #[must_use]
    pub fn new(pair: &CredentialPair) -> Self {
        Self::empty(RecordShape::Flat).with_pair(pair)
    }

    /// An empty record of the given shape.
    #[must_use]
    pub fn empty(shape: RecordShape) -> Self {
        let mut record = Map::new();
        if shape == RecordShape::Nested {
            record.insert(DATA.to_string(), Value::Object(Map::new()));
        }
        Self { shape, record }
    }

    #[must_use]
    pub fn shape(&self) -> RecordShape {
        self.shape
    }

    /// The token pair, if both tokens are present and non-empty.
    #[must_use]
    pub fn pair(&self) -> Option<CredentialPair> {
        let tokens = self.tokens()?;
        let access = tokens.get(ACCESS_TOKEN)?.as_str()?;
        let refresh = tokens.get(REFRESH_TOKEN)?.as_str()?;
        if access.is_empty() || refresh.is_empty() {
            return None;
        }
        Some(CredentialPair::new(access, refresh))
    }

    /// Returns the record with its tokens replaced by `pair`.
    #[must_use]
    pub fn with_pair(mut self, pair: &CredentialPair) -> Self {
        match self.shape {
            RecordShape::Flat => set_tokens(&mut self.record, pair),
            RecordShape::Nested => {
                if !self.record.get(DATA).is_some_and(Value::is_object) {
                    self.record
                        .insert(DATA.to_string(), Value::Object(Map::new()));
                }
                if let Some(Value::Object(data)) = self.record.get_mut(DATA) {
                    set_tokens(data, pair);
                }
            }
        }
        self
    }

    /// Any field of the record, by top-level key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.record.get(key)
    }

    fn tokens(&self) -> Option<&Map<String, Value>> {
        match self.shape {
            RecordShape::Flat => Some(&self.record),
            RecordShape::Nested => self.record.get(DATA)?.as_object(),
        }
    }
}

fn set_tokens(tokens: &mut Map<String, Value>, pair: &CredentialPair) {
    tokens.insert(
        ACCESS_TOKEN.to_string(),
        Value::String(pair.access_token.clone()),
    );
    tokens.insert(
        REFRESH_TOKEN.to_string(),
        Value::String(pair.refresh_token.clone()),
    );
}

impl From<Map<String, Value>> for StoredCredentials {
    fn from(record: Map<String, Value>) -> Self {
        let nested = !record.contains_key(ACCESS_TOKEN)
            && record
                .get(DATA)
                .and_then(Value::as_object)
                .is_some_and(|data| data.contains_key(ACCESS_TOKEN));
        let shape = if nested {
            RecordShape::Nested
        } else {
            RecordShape::Flat
        };
        Self { shape, record }
    }
}

impl From<StoredCredentials> for Map<String, Value> {
    fn from(value: StoredCredentials) -> Self {
        value.record
    }
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("shape", &self.shape)
            .field("fields", &self.record.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Holds the current credential pair, backed by a [`CredentialStorage`].
///
/// `read` never blocks on storage I/O. `replace` and `clear` swap the
/// in-memory record first and then persist; a persistence failure is returned
/// but the in-memory state is already correct.
pub struct CredentialStore {
    state: RwLock<Option<StoredCredentials>>,
    storage: Mutex<Box<dyn CredentialStorage>>,
}

impl CredentialStore {
    /// Opens the store, loading whatever record the storage holds.
    ///
    /// A record that cannot be loaded, or that lacks either token, is logged
    /// and treated as absent.
    pub fn open(storage: impl CredentialStorage + 'static) -> Self {
        let state = match storage.load() {
            Ok(Some(record)) if record.pair().is_some() => Some(record),
            Ok(Some(_)) => {
                tracing::warn!("Persisted credential record lacks a token pair. Ignoring it.");
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!("Failed to load persisted credentials: {e}");
                None
            }
        };

        Self {
            state: RwLock::new(state),
            storage: Mutex::new(Box::new(storage)),
        }
    }

    /// A store without durable backing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::open(MemoryCredentialStorage::new())
    }

    /// The current pair, if any.
    #[must_use]
    pub fn read(&self) -> Option<CredentialPair> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(StoredCredentials::pair)
    }

    /// Atomically replaces the current pair.
    ///
    /// # Errors
    /// Fails with [`Error::Persistence`](crate::Error::Persistence) if the
    /// record could not be written to storage.
    pub(crate) fn replace(&self, pair: &CredentialPair) -> Result<()> {
        // Held across the in-memory swap and the write so storage sees
        // updates in the same order as readers do.
        let storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);

        let record = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let record = match state.take() {
                Some(record) => record.with_pair(pair),
                None => StoredCredentials::new(pair),
            };
            *state = Some(record.clone());
            record
        };

        storage.save(&record)
    }

    /// Atomically removes the current pair.
    ///
    /// # Errors
    /// Fails with [`Error::Persistence`](crate::Error::Persistence) if the
    /// record could not be removed from storage.
    pub(crate) fn clear(&self) -> Result<()> {
        let storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        storage.remove()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.read().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> StoredCredentials {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_flat_record_is_read() {
        let flat = record(json!({"accessToken": "T1", "refreshToken": "RT1", "name": "Jo"}));
        assert_eq!(flat.shape(), RecordShape::Flat);
        assert_eq!(flat.pair(), Some(CredentialPair::new("T1", "RT1")));
    }

    #[test]
    fn test_nested_record_is_read() {
        let nested = record(json!({"data": {"accessToken": "T1", "refreshToken": "RT1"}}));
        assert_eq!(nested.shape(), RecordShape::Nested);
        assert_eq!(nested.pair(), Some(CredentialPair::new("T1", "RT1")));
    }

    #[test]
    fn test_record_with_empty_token_has_no_pair() {
        let empty_refresh = record(json!({"accessToken": "T1", "refreshToken": ""}));
        assert_eq!(empty_refresh.pair(), None);
        let missing_refresh = record(json!({"accessToken": "T1"}));
        assert_eq!(missing_refresh.pair(), None);
    }

    #[test]
    fn test_replacing_pair_keeps_shape_and_unrelated_fields() {
        let original = json!({
            "data": {"accessToken": "T1", "refreshToken": "RT1", "role": "staff"},
            "user": {"id": 7}
        });
        let updated = record(original).with_pair(&CredentialPair::new("T2", "RT2"));

        assert_eq!(
            serde_json::to_value(&updated).unwrap(),
            json!({
                "data": {"accessToken": "T2", "refreshToken": "RT2", "role": "staff"},
                "user": {"id": 7}
            })
        );
    }

    #[test]
    fn test_debug_does_not_leak_tokens() {
        let pair = CredentialPair::new("secret-access", "secret-refresh");
        let record = StoredCredentials::new(&pair);
        let rendered = format!("{pair:?} {record:?}");
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }

    #[test]
    fn test_store_loads_persisted_record() {
        let storage = MemoryCredentialStorage::with_record(StoredCredentials::new(
            &CredentialPair::new("T1", "RT1"),
        ));
        let store = CredentialStore::open(storage);
        assert_eq!(store.read(), Some(CredentialPair::new("T1", "RT1")));
    }

    #[test]
    fn test_store_ignores_record_without_tokens() {
        let storage = MemoryCredentialStorage::with_record(record(json!({"user": "x"})));
        let store = CredentialStore::open(storage);
        assert_eq!(store.read(), None);
    }

    #[test]
    fn test_replace_and_clear_are_persisted() {
        let storage = MemoryCredentialStorage::new();
        let store = CredentialStore::open(storage.clone());

        store.replace(&CredentialPair::new("T1", "RT1")).unwrap();
        assert_eq!(store.read(), Some(CredentialPair::new("T1", "RT1")));
        assert_eq!(
            storage.record().and_then(|r| r.pair()),
            Some(CredentialPair::new("T1", "RT1"))
        );

        store.clear().unwrap();
        assert_eq!(store.read(), None);
        assert!(storage.record().is_none());
    }

    #[test]
    fn test_persistence_failure_keeps_memory_state() {
        #[derive(Debug)]
        struct FailingStorage;

        impl CredentialStorage for FailingStorage {
            fn load(&self) -> Result<Option<StoredCredentials>> {
                Ok(None)
            }
            fn save(&self, _record: &StoredCredentials) -> Result<()> {
                Err(crate::Error::Persistence("disk full".to_string()))
            }
            fn remove(&self) -> Result<()> {
                Err(crate::Error::Persistence("disk full".to_string()))
            }
        }

        let store = CredentialStore::open(FailingStorage);
        assert!(store.replace(&CredentialPair::new("T1", "RT1")).is_err());
        assert_eq!(store.read(), Some(CredentialPair::new("T1", "RT1")));
        assert!(store.clear().is_err());
        assert_eq!(store.read(), None);
    }

    #[test]
    fn test_readers_never_observe_mixed_pairs() {
        let store = Arc::new(CredentialStore::in_memory());
        store.replace(&CredentialPair::new("A0", "RA0")).unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 1..500 {
                    store
                        .replace(&CredentialPair::new(format!("A{i}"), format!("RA{i}")))
                        .unwrap();
                }
            })
        };

        for _ in 0..2000 {
            let pair = store.read().unwrap();
            assert_eq!(format!("R{}", pair.access_token()), pair.refresh_token());
        }
        writer.join().unwrap();
    }
}
