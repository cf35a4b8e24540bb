use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use super::storage::SessionStorage;
use super::token::{Identity, TokenPair};

/// Token pair together with the identity decoded from its access token.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionData {
    pub tokens: TokenPair,
    pub identity: Identity,
}

impl SessionData {
    /// Decode `tokens.access`; `None` when it is not a readable token.
    pub fn from_tokens(tokens: TokenPair) -> Option<Self> {
        match Identity::decode(&tokens.access) {
            Ok(identity) => Some(Self { tokens, identity }),
            Err(e) => {
                warn!(error = %e, "Access token could not be decoded");
                None
            }
        }
    }
}

/// Owns the current session and its persisted record.
///
/// Tokens and identity live behind one lock, so a reader sees both or
/// neither. The lock is never held across an await point.
#[derive(Debug)]
pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
    data: RwLock<Option<SessionData>>,
}

impl SessionStore {
    /// Create an empty store. Call [`initialize`](Self::initialize) to load
    /// the persisted session.
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            storage,
            data: RwLock::new(None),
        }
    }

    /// Load the persisted session, if any.
    ///
    /// A record that does not parse or whose access token does not decode is
    /// removed and the store stays logged out. Returns whether a session was
    /// loaded.
    pub fn initialize(&self) -> bool {
        let mut data = self.write_data();

        let contents = match self.storage.read() {
            Ok(Some(contents)) => contents,
            Ok(None) => {
                debug!("No persisted session");
                *data = None;
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                *data = None;
                return false;
            }
        };

        let loaded = match serde_json::from_str::<TokenPair>(&contents) {
            Ok(tokens) => SessionData::from_tokens(tokens),
            Err(e) => {
                warn!(error = %e, "Persisted session is not a token pair");
                None
            }
        };

        match loaded {
            Some(session) => {
                debug!(user_id = %session.identity.user_id, "Session loaded");
                *data = Some(session);
                true
            }
            None => {
                if let Err(e) = self.storage.remove() {
                    warn!(error = %e, "Failed to remove corrupt session record");
                }
                *data = None;
                false
            }
        }
    }

    /// Replace the session with `tokens` and persist them.
    ///
    /// If the access token cannot be decoded the store is cleared instead and
    /// `None` is returned.
    pub fn set(&self, tokens: TokenPair) -> Option<Identity> {
        match SessionData::from_tokens(tokens) {
            Some(session) => Some(self.set_session(session)),
            None => {
                self.clear();
                None
            }
        }
    }

    /// Replace the session with an already decoded one and persist its
    /// tokens.
    pub fn set_session(&self, session: SessionData) -> Identity {
        let mut data = self.write_data();
        match serde_json::to_string(&session.tokens) {
            Ok(contents) => {
                if let Err(e) = self.storage.write(&contents) {
                    warn!(error = %e, "Failed to persist session");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize session"),
        }

        let identity = session.identity.clone();
        *data = Some(session);
        identity
    }

    /// Forget the session and remove its record. Safe to call repeatedly.
    pub fn clear(&self) {
        let mut data = self.write_data();
        if let Err(e) = self.storage.remove() {
            warn!(error = %e, "Failed to remove persisted session");
        }
        *data = None;
    }

    /// Snapshot of the current session.
    pub fn data(&self) -> Option<SessionData> {
        self.read_data().clone()
    }

    pub fn tokens(&self) -> Option<TokenPair> {
        self.read_data().as_ref().map(|d| d.tokens.clone())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read_data().as_ref().map(|d| d.identity.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_data().is_some()
    }

    fn read_data(&self) -> RwLockReadGuard<'_, Option<SessionData>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, Option<SessionData>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;
    use crate::auth::storage::{FileStorage, MemoryStorage};
    use crate::test_utils::{make_token, token_expiring_at};

    fn memory_store() -> (Arc<MemoryStorage>, SessionStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone());
        (storage, store)
    }

    #[test]
    fn test_set_then_initialize_restores_identity() {
        let dir = tempfile::tempdir().unwrap();
        let pair = TokenPair::new(token_expiring_at(1_700_000_000), "refresh-1");

        let store = SessionStore::new(Arc::new(FileStorage::new(dir.path())));
        let identity = store.set(pair.clone()).unwrap();
        assert_eq!(identity, Identity::decode(&pair.access).unwrap());

        // Fresh process reading the same storage
        let restarted = SessionStore::new(Arc::new(FileStorage::new(dir.path())));
        assert!(restarted.initialize());
        assert_eq!(restarted.tokens(), Some(pair.clone()));
        assert_eq!(restarted.identity(), Some(Identity::decode(&pair.access).unwrap()));
    }

    #[test]
    fn test_set_persists_plain_token_pair_record() {
        let (storage, store) = memory_store();
        let access = token_expiring_at(1_700_000_000);
        store.set(TokenPair::new(access.clone(), "refresh-1"));

        let record: serde_json::Value =
            serde_json::from_str(&storage.read().unwrap().unwrap()).unwrap();
        assert_eq!(record, json!({"access": access, "refresh": "refresh-1"}));
    }

    #[test]
    fn test_set_overwrites_previous_session() {
        let (storage, store) = memory_store();
        store.set(TokenPair::new(token_expiring_at(100), "r1"));
        store.set(TokenPair::new(token_expiring_at(200), "r2"));

        let data = store.data().unwrap();
        assert_eq!(data.tokens.refresh, "r2");
        assert_eq!(data.identity.expires_at, 200);
        assert!(storage.read().unwrap().unwrap().contains("r2"));
    }

    #[test]
    fn test_set_with_undecodable_token_logs_out() {
        let (storage, store) = memory_store();
        store.set(TokenPair::new(token_expiring_at(100), "r1"));

        assert_eq!(store.set(TokenPair::new("garbage", "r2")), None);
        assert!(!store.is_authenticated());
        assert_eq!(store.tokens(), None);
        assert_eq!(store.identity(), None);
        assert_eq!(storage.read().unwrap(), None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (storage, store) = memory_store();
        store.set(TokenPair::new(token_expiring_at(100), "r1"));

        store.clear();
        assert_eq!(store.tokens(), None);
        assert_eq!(store.identity(), None);
        assert_eq!(storage.read().unwrap(), None);

        store.clear();
        assert_eq!(store.tokens(), None);
        assert_eq!(store.identity(), None);
        assert_eq!(storage.read().unwrap(), None);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()));
        let store = SessionStore::new(storage.clone());
        store.set(TokenPair::new(token_expiring_at(100), "r1"));
        assert!(storage.path().exists());

        store.clear();
        store.clear();
        assert!(!storage.path().exists());
    }

    #[test]
    fn test_initialize_recovers_from_corrupt_json() {
        let storage = Arc::new(MemoryStorage::with_record("{not json"));
        let store = SessionStore::new(storage.clone());

        assert!(!store.initialize());
        assert_eq!(store.tokens(), None);
        assert_eq!(store.identity(), None);
        assert_eq!(storage.read().unwrap(), None);
    }

    #[test]
    fn test_initialize_recovers_from_undecodable_token() {
        let record = json!({"access": "not-a-jwt", "refresh": "r"}).to_string();
        let storage = Arc::new(MemoryStorage::with_record(record));
        let store = SessionStore::new(storage.clone());

        assert!(!store.initialize());
        assert!(!store.is_authenticated());
        assert_eq!(storage.read().unwrap(), None);
    }

    #[test]
    fn test_initialize_keeps_expired_access_token() {
        // The refresh token may still be good; the client refreshes on demand
        let record = json!({"access": token_expiring_at(1), "refresh": "r"}).to_string();
        let store = SessionStore::new(Arc::new(MemoryStorage::with_record(record)));

        assert!(store.initialize());
        assert_eq!(store.identity().unwrap().expires_at, 1);
    }

    #[test]
    fn test_initialize_without_record() {
        let (_, store) = memory_store();
        assert!(!store.initialize());
        assert!(!store.is_authenticated());
    }

    /// Storage whose reads always fail, e.g. a locked keychain.
    #[derive(Debug, Default)]
    struct UnreadableStorage {
        removed: AtomicBool,
    }

    impl SessionStorage for UnreadableStorage {
        fn read(&self) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("keychain is locked"))
        }

        fn write(&self, _contents: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn remove(&self) -> anyhow::Result<()> {
            self.removed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_initialize_with_unreadable_storage_stays_logged_out() {
        let storage = Arc::new(UnreadableStorage::default());
        let store = SessionStore::new(storage.clone());

        assert!(!store.initialize());
        assert!(!store.is_authenticated());
        assert_eq!(store.tokens(), None);
        // The record may be fine once the storage is readable again
        assert!(!storage.removed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_set_session_persists_decoded_session() {
        let (storage, store) = memory_store();
        let access = token_expiring_at(1_700_000_000);
        let session = SessionData {
            tokens: TokenPair::new(access.clone(), "refresh-1"),
            identity: Identity::decode(&access).unwrap(),
        };

        let identity = store.set_session(session.clone());
        assert_eq!(identity, session.identity);
        assert_eq!(store.data(), Some(session));

        let record: serde_json::Value =
            serde_json::from_str(&storage.read().unwrap().unwrap()).unwrap();
        assert_eq!(record, json!({"access": access, "refresh": "refresh-1"}));
    }

    #[test]
    fn test_identity_tracks_access_token() {
        let (_, store) = memory_store();
        let token = make_token(json!({"user_id": "u-1", "exp": 50, "name": "Ada Lovelace"}));
        store.set(TokenPair::new(token, "r"));
        assert_eq!(store.identity().unwrap().display_name(), "Ada Lovelace");
    }
}
