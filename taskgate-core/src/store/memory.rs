//! In-process [`RateLimitStore`].
//!
//! Mirrors the Redis semantics the limiter relies on: lazy key expiry, sorted
//! sets ordered by `(score, member)`, and `ZREMRANGEBYSCORE` with inclusive
//! bounds. Counters are local to this process.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{RateLimitStore, StoreError};

#[derive(Debug)]
enum Value {
    String(String),
    SortedSet(BTreeSet<(i64, String)>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    fn wrong_type(command: &'static str) -> StoreError {
        StoreError::Command {
            command,
            message: "WRONGTYPE Operation against a key holding the wrong kind of value"
                .to_string(),
        }
    }
}

/// Look up a live entry, evicting it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        match live(&mut entries, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::String(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_type("GET")),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::String(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        match live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        // Evict an expired key before reusing its slot
        let _ = live(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::SortedSet(BTreeSet::new()),
            expires_at: None,
        });
        let Value::SortedSet(set) = &mut entry.value else {
            return Err(Self::wrong_type("ZADD"));
        };
        // ZADD updates the score of an existing member
        set.retain(|(_, m)| m != member);
        set.insert((score, member.to_string()));
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock();
        let Some(entry) = live(&mut entries, key) else {
            return Ok(0);
        };
        let Value::SortedSet(set) = &mut entry.value else {
            return Err(Self::wrong_type("ZREMRANGEBYSCORE"));
        };
        let before = set.len();
        set.retain(|(score, _)| *score < min || *score > max);
        let removed = (before - set.len()) as u64;
        if set.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock();
        match live(&mut entries, key) {
            None => Ok(0),
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(Self::wrong_type("ZCARD")),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
