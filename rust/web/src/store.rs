//! Ephemeral shared state: every record lives under a namespaced key with its
//! own expiry, so any server process can serve any session.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tavern_engine::session::Session;
use thiserror::Error;

/// Read-modify-write attempts before giving up on a contended key.
pub const MAX_COMMIT_ATTEMPTS: usize = 5;

/// Key layout shared by every component.
pub mod keys {
    pub fn session(id: &str) -> String {
        format!("session:{id}")
    }

    pub fn connections(session_id: &str) -> String {
        format!("session:{session_id}:connections")
    }

    pub fn session_updates(session_id: &str) -> String {
        format!("session:{session_id}:updates")
    }

    pub fn lobby(user_id: &str) -> String {
        format!("lobby:{user_id}")
    }

    pub const LOBBY_PRESENCE: &str = "lobby:presence";

    pub const PRESENCE_PREFIX: &str = "presence:";

    pub fn presence(user_id: &str) -> String {
        format!("{PRESENCE_PREFIX}{user_id}")
    }

    pub const CHALLENGE_PREFIX: &str = "challenge:";

    pub fn challenge(id: &str) -> String {
        format!("{CHALLENGE_PREFIX}{id}")
    }

    /// Session id from a `session:{id}:connections` key.
    pub fn session_of_connections(key: &str) -> Option<&str> {
        key.strip_prefix("session:")?.strip_suffix(":connections")
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Value at `{key}` is not a {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("Failed to encode or decode `{key}`: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Concurrent updates to `{0}` kept conflicting")]
    Conflict(String),
}

/// Minimal key-value contract with per-key expiry. Every write re-arms the
/// key's TTL; expired keys are invisible to reads.
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Writes only when the key is absent. Returns whether it wrote.
    fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError>;

    /// Writes only when the current value equals `expected`.
    fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    fn hash_set(&self, key: &str, field: &str, value: String, ttl: Duration)
        -> Result<(), StoreError>;

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Drops expired entries eagerly. Backends with native expiry need not.
    fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process store backed by a single `RwLock<HashMap>`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        entries.get(key).filter(|e| e.is_live(Instant::now()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.read()?;
        match Self::live(&entries, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::Hash(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.write()?;
        entries.insert(key.to_string(), Entry::new(Value::Text(value), ttl));
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.write()?;
        if Self::live(&entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(Value::Text(value), ttl));
        Ok(true)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.write()?;
        let matches = matches!(
            Self::live(&entries, key).map(|e| &e.value),
            Some(Value::Text(current)) if current == expected
        );
        if matches {
            entries.insert(key.to_string(), Entry::new(Value::Text(value), ttl));
        }
        Ok(matches)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.write()?;
        Ok(entries
            .remove(key)
            .is_some_and(|e| e.is_live(Instant::now())))
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.write()?;
        let now = Instant::now();
        match entries.get_mut(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut entries = self.write()?;
        let now = Instant::now();
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if !e.is_live(now) {
                    *e = Entry::new(Value::Hash(HashMap::new()), ttl);
                }
            })
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new()), ttl));
        match &mut entry.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value);
                entry.expires_at = now + ttl;
                Ok(())
            }
            Value::Text(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "hash",
            }),
        }
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let entries = self.read()?;
        match Self::live(&entries, key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(map)) => Ok(map.clone()),
            Some(Value::Text(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "hash",
            }),
        }
    }

    fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut entries = self.write()?;
        let now = Instant::now();
        let Some(entry) = entries.get_mut(key).filter(|e| e.is_live(now)) else {
            return Ok(false);
        };
        let (removed, now_empty) = match &mut entry.value {
            Value::Hash(map) => (map.remove(field).is_some(), map.is_empty()),
            Value::Text(_) => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                    expected: "hash",
                })
            }
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.read()?;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut entries = self.write()?;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}

pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

pub fn get_json<T: DeserializeOwned>(
    kv: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    kv.get(key)?.map(|raw| decode(key, &raw)).transpose()
}

pub fn put_json<T: Serialize>(
    kv: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), StoreError> {
    kv.set(key, encode(key, value)?, ttl)
}

/// Result of a committed [`update_record`].
#[derive(Debug, Clone)]
pub struct Updated<T, O = ()> {
    pub previous: T,
    pub current: T,
    /// Whatever the committing attempt of the operation produced alongside.
    pub output: O,
}

/// Optimistic read-modify-write of a JSON record.
///
/// `op` sees the current value and returns the replacement, its TTL and an
/// auxiliary output. When another writer got there first, the record is
/// re-read and `op` runs again against the fresh value, so validation always
/// happens against what is actually committed. Returns `Ok(None)` when the key
/// does not exist.
pub fn update_record<T, O, E, F>(
    kv: &dyn KeyValueStore,
    key: &str,
    mut op: F,
) -> Result<Option<Updated<T, O>>, E>
where
    T: Serialize + DeserializeOwned,
    E: From<StoreError>,
    F: FnMut(&T) -> Result<(T, Duration, O), E>,
{
    for attempt in 1..=MAX_COMMIT_ATTEMPTS {
        let Some(raw) = kv.get(key)? else {
            return Ok(None);
        };
        let previous: T = decode(key, &raw)?;
        let (current, ttl, output) = op(&previous)?;
        let encoded = encode(key, &current)?;
        if kv.compare_and_set(key, &raw, encoded, ttl)? {
            return Ok(Some(Updated {
                previous,
                current,
                output,
            }));
        }
        tracing::debug!(key = %key, attempt, "optimistic update lost a race, retrying");
    }
    Err(StoreError::Conflict(key.to_string()).into())
}

/// `create / get / update / delete` over `session:{id}` records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Returns `false` if a session with this id already exists.
    pub fn create(&self, session: &Session, ttl: Duration) -> Result<bool, StoreError> {
        let key = keys::session(&session.id);
        self.kv.set_if_absent(&key, encode(&key, session)?, ttl)
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        get_json(self.kv.as_ref(), &keys::session(id))
    }

    pub fn update<O, E, F>(&self, id: &str, op: F) -> Result<Option<Updated<Session, O>>, E>
    where
        E: From<StoreError>,
        F: FnMut(&Session) -> Result<(Session, Duration, O), E>,
    {
        update_record(self.kv.as_ref(), &keys::session(id), op)
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.kv.delete(&keys::session(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::thread;

    const LONG: Duration = Duration::from_secs(60);

    #[test]
    fn values_disappear_after_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", "v".into(), Duration::from_millis(20))
            .expect("set");
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.set_if_absent("k", "again".into(), LONG).unwrap());
    }

    #[test]
    fn writes_rearm_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), Duration::from_millis(30)).unwrap();
        thread::sleep(Duration::from_millis(15));
        assert!(store.expire("k", LONG).unwrap());
        thread::sleep(Duration::from_millis(30));
        assert!(store.get("k").unwrap().is_some());
    }

    #[test]
    fn compare_and_set_only_replaces_expected_value() {
        let store = MemoryStore::new();
        store.set("k", "one".into(), LONG).unwrap();

        assert!(!store.compare_and_set("k", "zero", "two".into(), LONG).unwrap());
        assert!(store.compare_and_set("k", "one", "two".into(), LONG).unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
        assert!(!store.compare_and_set("missing", "", "x".into(), LONG).unwrap());
    }

    #[test]
    fn hash_fields_share_key_expiry() {
        let store = MemoryStore::new();
        store.hash_set("h", "a", "1".into(), LONG).unwrap();
        store.hash_set("h", "b", "2".into(), LONG).unwrap();
        assert_eq!(store.hash_get_all("h").unwrap().len(), 2);

        assert!(store.hash_delete("h", "a").unwrap());
        assert!(!store.hash_delete("h", "a").unwrap());
        assert!(store.hash_delete("h", "b").unwrap());
        assert!(store.scan_prefix("h").unwrap().is_empty());

        assert!(matches!(
            store.get("missing-hash"),
            Ok(None)
        ));
        store.hash_set("h", "a", "1".into(), LONG).unwrap();
        assert!(matches!(store.get("h"), Err(StoreError::WrongType { .. })));
    }

    #[test]
    fn scan_and_purge_skip_expired_keys() {
        let store = MemoryStore::new();
        store.set("p:1", "a".into(), LONG).unwrap();
        store.set("p:2", "b".into(), Duration::from_millis(10)).unwrap();
        store.set("q:1", "c".into(), LONG).unwrap();
        thread::sleep(Duration::from_millis(25));

        assert_eq!(store.scan_prefix("p:").unwrap(), vec!["p:1".to_string()]);
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        n: u32,
    }

    #[test]
    fn update_record_serializes_concurrent_writers() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        put_json(store.as_ref(), "c", &Counter { n: 0 }, LONG).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut done = 0;
                    while done < 10 {
                        let result = update_record::<Counter, (), StoreError, _>(
                            store.as_ref(),
                            "c",
                            |c| Ok((Counter { n: c.n + 1 }, LONG, ())),
                        );
                        match result {
                            Ok(Some(_)) => done += 1,
                            Err(StoreError::Conflict(_)) => continue,
                            other => panic!("unexpected: {other:?}"),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let counter: Counter = get_json(store.as_ref(), "c").unwrap().unwrap();
        assert_eq!(counter, Counter { n: 40 });
    }

    #[test]
    fn update_record_reports_missing_keys() {
        let store = MemoryStore::new();
        let result = update_record::<Counter, (), StoreError, _>(&store, "nope", |c| {
            Ok((Counter { n: c.n }, LONG, ()))
        });
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn connection_keys_round_trip_to_session_ids() {
        assert_eq!(
            keys::session_of_connections(&keys::connections("abc")),
            Some("abc")
        );
        assert_eq!(keys::session_of_connections(&keys::session("abc")), None);
    }
}
