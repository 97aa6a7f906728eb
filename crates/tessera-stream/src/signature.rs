//! Cache of thinking signatures, keyed by conversation session.
//!
//! Each session holds a bounded set of [`SignedThinking`] entries indexed by a
//! hash of the exact thinking text. Entries expire after a TTL; when a
//! session is full, the oldest entry is evicted.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default lifetime of a cached signature.
pub const DEFAULT_TTL_SECONDS: u64 = 60 * 60;

/// Default number of signatures kept per session.
pub const DEFAULT_MAX_ENTRIES_PER_SESSION: usize = 100;

/// Default number of sessions kept before the least recently used is dropped.
pub const DEFAULT_MAX_SESSIONS: usize = 1_000;

/// Thinking text paired with the signature issued for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedThinking {
    pub text: String,
    pub signature: String,
}

impl SignedThinking {
    pub fn new(text: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            signature: signature.into(),
        }
    }
}

/// Bounds for the signature store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureStoreConfig {
    pub ttl_seconds: u64,
    pub max_entries_per_session: usize,
    pub max_sessions: usize,
}

impl Default for SignatureStoreConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            max_entries_per_session: DEFAULT_MAX_ENTRIES_PER_SESSION,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl SignatureStoreConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_seconds = ttl.as_secs();
        self
    }

    pub fn with_max_entries_per_session(mut self, max: usize) -> Self {
        self.max_entries_per_session = max;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }
}

#[derive(Debug, Clone)]
struct CachedSignature {
    signed: SignedThinking,
    cached_at: Instant,
}

impl CachedSignature {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

#[derive(Debug)]
struct SessionSignatures {
    /// Text hash -> entry, oldest first.
    by_text: LruCache<String, CachedSignature>,
    /// Most recently stored entry.
    latest: Option<CachedSignature>,
}

impl SessionSignatures {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            by_text: LruCache::new(capacity),
            latest: None,
        }
    }

    /// Drop expired entries, returning how many were removed.
    fn purge_expired(&mut self, ttl: Duration) -> usize {
        let expired: Vec<String> = self
            .by_text
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl))
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &expired {
            self.by_text.pop(hash);
        }
        if self.latest.as_ref().is_some_and(|e| e.is_expired(ttl)) {
            self.latest = None;
        }
        expired.len()
    }

    fn is_empty(&self) -> bool {
        self.by_text.is_empty() && self.latest.is_none()
    }
}

/// Thread-safe signature cache shared by concurrent stream transforms.
#[derive(Debug)]
pub struct SignatureStore {
    sessions: Mutex<LruCache<String, SessionSignatures>>,
    ttl: Duration,
    per_session: NonZeroUsize,
}

impl Default for SignatureStore {
    fn default() -> Self {
        Self::new(SignatureStoreConfig::default())
    }
}

impl SignatureStore {
    pub fn new(config: SignatureStoreConfig) -> Self {
        let max_sessions = NonZeroUsize::new(config.max_sessions).unwrap_or(NonZeroUsize::MIN);
        let per_session =
            NonZeroUsize::new(config.max_entries_per_session).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Mutex::new(LruCache::new(max_sessions)),
            ttl: Duration::from_secs(config.ttl_seconds),
            per_session,
        }
    }

    /// Most recently stored signature for a session.
    pub fn get(&self, session_key: &str) -> Option<SignedThinking> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get(session_key)?;
        match &session.latest {
            Some(entry) if !entry.is_expired(self.ttl) => Some(entry.signed.clone()),
            _ => None,
        }
    }

    /// Signature cached for exactly `text` in a session.
    pub fn lookup(&self, session_key: &str, text: &str) -> Option<String> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(session_key)?;
        let hash = text_hash(text);
        let expired = session.by_text.peek(&hash)?.is_expired(self.ttl);
        if expired {
            session.by_text.pop(&hash);
            return None;
        }
        session
            .by_text
            .peek(&hash)
            .filter(|entry| entry.signed.text == text)
            .map(|entry| entry.signed.signature.clone())
    }

    /// Store a signature for a session.
    ///
    /// Expired entries are dropped before inserting; a full session then
    /// evicts its oldest entry.
    pub fn set(&self, session_key: &str, signed: SignedThinking) {
        let mut sessions = self.sessions.lock();
        let per_session = self.per_session;
        let session = sessions.get_or_insert_mut(session_key.to_string(), || {
            SessionSignatures::new(per_session)
        });

        session.purge_expired(self.ttl);

        let hash = text_hash(&signed.text);
        let entry = CachedSignature {
            signed,
            cached_at: Instant::now(),
        };
        if let Some((evicted, _)) = session.by_text.push(hash.clone(), entry.clone()) {
            if evicted != hash {
                tracing::trace!(session = %session_key, evicted = %evicted, "Evicted oldest signature");
            }
        }
        session.latest = Some(entry);
    }

    /// Whether a live signature is cached for a session.
    pub fn has(&self, session_key: &str) -> bool {
        self.get(session_key).is_some()
    }

    /// Forget a session. Returns whether anything was removed.
    pub fn delete(&self, session_key: &str) -> bool {
        self.sessions.lock().pop(session_key).is_some()
    }

    /// Drop expired entries across all sessions. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let mut removed = 0;
        let mut empty = Vec::new();
        for (key, session) in sessions.iter_mut() {
            removed += session.purge_expired(self.ttl);
            if session.is_empty() {
                empty.push(key.clone());
            }
        }
        for key in empty {
            sessions.pop(&key);
        }
        removed
    }

    /// Number of signatures held for a session.
    pub fn entry_count(&self, session_key: &str) -> usize {
        self.sessions
            .lock()
            .peek(session_key)
            .map_or(0, |s| s.by_text.len())
    }

    /// Number of sessions with cached state.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Hex SHA-256 prefix used to index thinking text.
fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_get_has_delete() {
        let store = SignatureStore::default();
        assert!(!store.has("s1"));
        assert!(store.get("s1").is_none());

        store.set("s1", SignedThinking::new("thinking", "sig-1"));
        assert!(store.has("s1"));
        assert_eq!(store.get("s1"), Some(SignedThinking::new("thinking", "sig-1")));

        assert!(store.delete("s1"));
        assert!(!store.delete("s1"));
        assert!(!store.has("s1"));
    }

    #[test]
    fn test_latest_wins_and_lookup_by_text() {
        let store = SignatureStore::default();
        store.set("s1", SignedThinking::new("first", "sig-a"));
        store.set("s1", SignedThinking::new("second", "sig-b"));

        assert_eq!(store.get("s1").unwrap().signature, "sig-b");
        assert_eq!(store.lookup("s1", "first").as_deref(), Some("sig-a"));
        assert_eq!(store.lookup("s1", "second").as_deref(), Some("sig-b"));
        assert!(store.lookup("s1", "never seen").is_none());
        assert!(store.lookup("s2", "first").is_none());
        assert_eq!(store.entry_count("s1"), 2);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = SignatureStore::default();
        store.set("s1", SignedThinking::new("same", "sig-1"));
        store.set("s2", SignedThinking::new("same", "sig-2"));
        assert_eq!(store.lookup("s1", "same").as_deref(), Some("sig-1"));
        assert_eq!(store.lookup("s2", "same").as_deref(), Some("sig-2"));
        assert_eq!(store.session_count(), 2);
    }

    #[test]
    fn test_per_session_capacity_evicts_oldest() {
        let store =
            SignatureStore::new(SignatureStoreConfig::default().with_max_entries_per_session(2));
        store.set("s1", SignedThinking::new("one", "1"));
        store.set("s1", SignedThinking::new("two", "2"));
        store.set("s1", SignedThinking::new("three", "3"));

        assert_eq!(store.entry_count("s1"), 2);
        assert!(store.lookup("s1", "one").is_none());
        assert_eq!(store.lookup("s1", "two").as_deref(), Some("2"));
        assert_eq!(store.lookup("s1", "three").as_deref(), Some("3"));
    }

    #[test]
    fn test_entries_expire() {
        let store = SignatureStore::new(SignatureStoreConfig {
            ttl_seconds: 0,
            ..Default::default()
        });
        store.set("s1", SignedThinking::new("thinking", "sig"));
        thread::sleep(Duration::from_millis(5));

        assert!(!store.has("s1"));
        assert!(store.lookup("s1", "thinking").is_none());
    }

    #[test]
    fn test_purge_expired_drops_empty_sessions() {
        let store = SignatureStore::new(SignatureStoreConfig {
            ttl_seconds: 0,
            ..Default::default()
        });
        store.set("s1", SignedThinking::new("a", "1"));
        store.set("s2", SignedThinking::new("b", "2"));
        thread::sleep(Duration::from_millis(5));

        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_session_capacity() {
        let store = SignatureStore::new(SignatureStoreConfig::default().with_max_sessions(1));
        store.set("s1", SignedThinking::new("a", "1"));
        store.set("s2", SignedThinking::new("b", "2"));
        assert!(!store.has("s1"));
        assert!(store.has("s2"));
    }

    #[test]
    fn test_concurrent_writers() {
        let store = std::sync::Arc::new(SignatureStore::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    for j in 0..50 {
                        store.set("shared", SignedThinking::new(format!("{i}-{j}"), format!("sig-{i}-{j}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.entry_count("shared"), DEFAULT_MAX_ENTRIES_PER_SESSION);
        assert!(store.has("shared"));
    }

    #[test]
    fn test_text_hash_is_stable() {
        assert_eq!(text_hash("abc"), text_hash("abc"));
        assert_ne!(text_hash("abc"), text_hash("abd"));
        assert_eq!(text_hash("abc").len(), 32);
    }
}
