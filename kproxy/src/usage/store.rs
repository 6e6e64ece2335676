//! Persistence interface for daily usage counters and live session records, per §4.3.
//!
//! This crate ships exactly one conforming implementation, [`InMemoryUsageStore`]: a sharded
//! map, each shard behind its own `tokio::sync::Mutex`: when no server-side atomic
//! create-or-increment primitive is available, a local mutex per key stands in for one. A
//! Redis-backed (or similar) implementation is a valid drop-in behind the same trait but is out
//! of scope here.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher as _};
use std::time::SystemTime;

use async_trait::async_trait;
use time::Date;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::policy::model::{Category, DeviceId};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DailyKey {
    pub date: Date,
    pub device: DeviceId,
    pub category: Category,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DailyCounter {
    pub total_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct UsageSession {
    pub id: String,
    pub device: DeviceId,
    pub category: Category,
    pub start_time: SystemTime,
    pub last_activity_time: SystemTime,
    pub accumulated_seconds: u64,
    pub active: bool,
}

/// Abstract interface over a persistence backend for daily counters and sessions. Every
/// implementation must be race-safe: concurrent `increment_daily` calls for the same key must
/// not lose updates.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get_daily(&self, key: &DailyKey) -> Result<Option<DailyCounter>, StorageError>;

    /// Atomically creates-or-adds `seconds` to the counter for `key`, refreshing its TTL.
    async fn increment_daily(&self, key: &DailyKey, seconds: u64) -> Result<(), StorageError>;

    async fn list_daily(&self, date: Date) -> Result<Vec<(DailyKey, DailyCounter)>, StorageError>;

    async fn delete_daily_before(&self, cutoff: Date) -> Result<(), StorageError>;

    /// Writes full session state. If `active`, indexes by `(device, category)` and into the
    /// active set; if not, removes from both indices.
    async fn upsert_session(&self, session: UsageSession) -> Result<(), StorageError>;

    async fn get_session(&self, id: &str) -> Result<Option<UsageSession>, StorageError>;

    async fn get_active_session_for(&self, device: &str, category: &str) -> Result<Option<UsageSession>, StorageError>;

    async fn list_active_sessions(&self) -> Result<Vec<UsageSession>, StorageError>;

    async fn delete_session(&self, id: &str) -> Result<(), StorageError>;
}

fn shard_of<T: Hash>(key: &T) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

struct DailyShard {
    counters: HashMap<DailyKey, DailyCounter>,
}

struct SessionShard {
    sessions: HashMap<String, UsageSession>,
}

/// In-memory `UsageStore`, sharded for reduced contention under concurrent policy evaluations.
/// Holds no TTL wheel; expiry happens lazily via `delete_daily_before`, called by the reset
/// scheduler once a day.
pub struct InMemoryUsageStore {
    daily: Vec<Mutex<DailyShard>>,
    sessions: Vec<Mutex<SessionShard>>,
    active_index: Mutex<HashMap<(DeviceId, Category), String>>,
    active_ids: Mutex<HashSet<String>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self {
            daily: (0..SHARD_COUNT).map(|_| Mutex::new(DailyShard { counters: HashMap::new() })).collect(),
            sessions: (0..SHARD_COUNT)
                .map(|_| Mutex::new(SessionShard { sessions: HashMap::new() }))
                .collect(),
            active_index: Mutex::new(HashMap::new()),
            active_ids: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for InMemoryUsageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn get_daily(&self, key: &DailyKey) -> Result<Option<DailyCounter>, StorageError> {
        let shard = &self.daily[shard_of(key)];
        Ok(shard.lock().await.counters.get(key).copied())
    }

    async fn increment_daily(&self, key: &DailyKey, seconds: u64) -> Result<(), StorageError> {
        let shard = &self.daily[shard_of(key)];
        let mut guard = shard.lock().await;
        let counter = guard.counters.entry(key.clone()).or_insert_with(DailyCounter::default);
        counter.total_seconds = counter.total_seconds.saturating_add(seconds);
        Ok(())
    }

    async fn list_daily(&self, date: Date) -> Result<Vec<(DailyKey, DailyCounter)>, StorageError> {
        let mut out = Vec::new();
        for shard in &self.daily {
            let guard = shard.lock().await;
            out.extend(
                guard
                    .counters
                    .iter()
                    .filter(|(k, _)| k.date == date)
                    .map(|(k, v)| (k.clone(), *v)),
            );
        }
        Ok(out)
    }

    async fn delete_daily_before(&self, cutoff: Date) -> Result<(), StorageError> {
        for shard in &self.daily {
            shard.lock().await.counters.retain(|k, _| k.date >= cutoff);
        }
        Ok(())
    }

    async fn upsert_session(&self, session: UsageSession) -> Result<(), StorageError> {
        let index_key = (session.device.clone(), session.category.clone());

        if session.active {
            self.active_index.lock().await.insert(index_key, session.id.clone());
            self.active_ids.lock().await.insert(session.id.clone());
        } else {
            self.active_index.lock().await.remove(&index_key);
            self.active_ids.lock().await.remove(&session.id);
        }

        let shard = &self.sessions[shard_of(&session.id)];
        shard.lock().await.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<UsageSession>, StorageError> {
        let shard = &self.sessions[shard_of(&id.to_owned())];
        Ok(shard.lock().await.sessions.get(id).cloned())
    }

    async fn get_active_session_for(&self, device: &str, category: &str) -> Result<Option<UsageSession>, StorageError> {
        let index_key = (device.to_owned(), category.to_owned());
        let Some(id) = self.active_index.lock().await.get(&index_key).cloned() else {
            return Ok(None);
        };
        self.get_session(&id).await
    }

    async fn list_active_sessions(&self) -> Result<Vec<UsageSession>, StorageError> {
        let ids: Vec<String> = self.active_ids.lock().await.iter().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.get_session(&id).await? {
                out.push(session);
            }
        }
        Ok(out)
    }

    async fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        if let Some(session) = self.get_session(id).await? {
            let index_key = (session.device, session.category);
            self.active_index.lock().await.remove(&index_key);
        }
        self.active_ids.lock().await.remove(id);
        let shard = &self.sessions[shard_of(&id.to_owned())];
        shard.lock().await.sessions.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn key(device: &str, category: &str) -> DailyKey {
        DailyKey {
            date: date!(2024 - 01 - 02),
            device: device.to_owned(),
            category: category.to_owned(),
        }
    }

    #[tokio::test]
    async fn increment_daily_creates_then_adds() {
        let store = InMemoryUsageStore::new();
        let k = key("dev1", "entertainment");
        store.increment_daily(&k, 30).await.unwrap();
        store.increment_daily(&k, 45).await.unwrap();
        let counter = store.get_daily(&k).await.unwrap().unwrap();
        assert_eq!(counter.total_seconds, 75);
    }

    #[tokio::test]
    async fn delete_daily_before_prunes_old_dates() {
        let store = InMemoryUsageStore::new();
        let old = DailyKey {
            date: date!(2023 - 01 - 01),
            device: "dev1".into(),
            category: "entertainment".into(),
        };
        let fresh = key("dev1", "entertainment");
        store.increment_daily(&old, 10).await.unwrap();
        store.increment_daily(&fresh, 10).await.unwrap();
        store.delete_daily_before(date!(2024 - 01 - 01)).await.unwrap();
        assert!(store.get_daily(&old).await.unwrap().is_none());
        assert!(store.get_daily(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn active_session_indexed_by_device_category() {
        let store = InMemoryUsageStore::new();
        let session = UsageSession {
            id: "s1".into(),
            device: "dev1".into(),
            category: "entertainment".into(),
            start_time: SystemTime::now(),
            last_activity_time: SystemTime::now(),
            accumulated_seconds: 0,
            active: true,
        };
        store.upsert_session(session).await.unwrap();

        let found = store.get_active_session_for("dev1", "entertainment").await.unwrap();
        assert!(found.is_some());
        assert_eq!(store.list_active_sessions().await.unwrap().len(), 1);

        store.delete_session("s1").await.unwrap();
        assert!(store.get_active_session_for("dev1", "entertainment").await.unwrap().is_none());
    }
}
