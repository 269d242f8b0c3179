//! In-process implementation of the session directory.
//!
//! A single mutex guards all key families, which makes the forward/reverse
//! writes of `put_session` and `delete_session` trivially atomic. Expired
//! entries are dropped lazily on access; the reaper reconciles anything
//! that lingers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{KvDirectory, KvError, SessionKey, SessionRecord};

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<SessionKey, Expiring<SessionRecord>>,
    owners: HashMap<String, Expiring<SessionKey>>,
    tombstones: HashMap<SessionKey, Expiring<()>>,
    counters: HashMap<String, Expiring<u64>>,
}

impl Tables {
    fn purge(&mut self) {
        self.sessions.retain(|_, e| e.live());
        self.owners.retain(|_, e| e.live());
        self.tombstones.retain(|_, e| e.live());
        self.counters.retain(|_, e| e.live());
    }
}

/// Mutex-guarded expiring map. Suitable for a single-instance deployment;
/// multi-instance deployments put a shared store behind [`KvDirectory`].
#[derive(Debug, Default)]
pub struct MemoryKv {
    tables: Mutex<Tables>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, KvError> {
        self.tables.lock().map_err(|e| KvError::Unavailable {
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl KvDirectory for MemoryKv {
    async fn get_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, KvError> {
        let mut tables = self.tables()?;
        tables.purge();
        Ok(tables.sessions.get(key).map(|e| e.value.clone()))
    }

    async fn put_session(
        &self,
        key: &SessionKey,
        record: SessionRecord,
        ttl: Duration,
    ) -> Result<(), KvError> {
        let mut tables = self.tables()?;
        tables.purge();
        tables
            .owners
            .insert(record.container_id.clone(), Expiring::new(key.clone(), ttl));
        tables.sessions.insert(key.clone(), Expiring::new(record, ttl));
        Ok(())
    }

    async fn refresh_ttl(&self, key: &SessionKey, ttl: Duration) -> Result<bool, KvError> {
        let mut tables = self.tables()?;
        tables.purge();
        let Some(entry) = tables.sessions.get_mut(key) else {
            return Ok(false);
        };
        entry.expires_at = Instant::now() + ttl;
        entry.value.last_used_at = chrono::Utc::now();
        let container_id = entry.value.container_id.clone();
        if let Some(owner) = tables.owners.get_mut(&container_id) {
            owner.expires_at = Instant::now() + ttl;
        }
        Ok(true)
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<(), KvError> {
        let mut tables = self.tables()?;
        if let Some(entry) = tables.sessions.remove(key) {
            tables.owners.remove(&entry.value.container_id);
        }
        Ok(())
    }

    async fn get_owner(&self, container_id: &str) -> Result<Option<SessionKey>, KvError> {
        let mut tables = self.tables()?;
        tables.purge();
        Ok(tables.owners.get(container_id).map(|e| e.value.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<(SessionKey, SessionRecord)>, KvError> {
        let mut tables = self.tables()?;
        tables.purge();
        Ok(tables
            .sessions
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn mark_destroyed(&self, key: &SessionKey, ttl: Duration) -> Result<(), KvError> {
        let mut tables = self.tables()?;
        tables.tombstones.insert(key.clone(), Expiring::new((), ttl));
        Ok(())
    }

    async fn is_destroyed(&self, key: &SessionKey) -> Result<bool, KvError> {
        let mut tables = self.tables()?;
        tables.purge();
        Ok(tables.tombstones.contains_key(key))
    }

    async fn clear_destroyed(&self, key: &SessionKey) -> Result<(), KvError> {
        let mut tables = self.tables()?;
        tables.tombstones.remove(key);
        Ok(())
    }

    async fn incr_rate_counter(&self, user_id: &str, window: Duration) -> Result<u64, KvError> {
        let mut tables = self.tables()?;
        tables.purge();
        let window_secs = window.as_secs().max(1);
        let window_index = chrono::Utc::now().timestamp() as u64 / window_secs;
        let key = format!("ratelimit:{user_id}:{window_index}");
        match tables.counters.get_mut(&key) {
            Some(entry) => {
                entry.value += 1;
                Ok(entry.value)
            }
            None => {
                tables.counters.insert(key, Expiring::new(1, window));
                Ok(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str, sid: &str) -> SessionKey {
        SessionKey::new(user, sid)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let kv = MemoryKv::new();
        let k = key("alice", "s1");
        kv.put_session(&k, SessionRecord::new("cid-1", None), TTL)
            .await
            .unwrap();

        let record = kv.get_session(&k).await.unwrap().unwrap();
        assert_eq!(record.container_id, "cid-1");
        assert!(record.volume_name.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let kv = MemoryKv::new();
        assert!(kv.get_session(&key("a", "s")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_writes_reverse_index() {
        let kv = MemoryKv::new();
        let k = key("alice", "s1");
        kv.put_session(&k, SessionRecord::new("cid-1", None), TTL)
            .await
            .unwrap();

        let owner = kv.get_owner("cid-1").await.unwrap().unwrap();
        assert_eq!(owner, k);
    }

    #[tokio::test]
    async fn test_delete_removes_both_keys() {
        let kv = MemoryKv::new();
        let k = key("alice", "s1");
        kv.put_session(&k, SessionRecord::new("cid-1", None), TTL)
            .await
            .unwrap();
        kv.delete_session(&k).await.unwrap();

        assert!(kv.get_session(&k).await.unwrap().is_none());
        assert!(kv.get_owner("cid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let kv = MemoryKv::new();
        let k = key("alice", "s1");
        kv.put_session(
            &k,
            SessionRecord::new("cid-1", None),
            Duration::from_millis(5),
        )
        .await
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(kv.get_session(&k).await.unwrap().is_none());
        assert!(kv.get_owner("cid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_extends_ttl_and_bumps_last_used() {
        let kv = MemoryKv::new();
        let k = key("alice", "s1");
        kv.put_session(
            &k,
            SessionRecord::new("cid-1", None),
            Duration::from_millis(30),
        )
        .await
        .unwrap();
        let before = kv.get_session(&k).await.unwrap().unwrap().last_used_at;

        std::thread::sleep(Duration::from_millis(10));
        assert!(kv.refresh_ttl(&k, TTL).await.unwrap());

        std::thread::sleep(Duration::from_millis(40));
        let record = kv.get_session(&k).await.unwrap();
        let record = record.expect("refreshed session should outlive original ttl");
        assert!(record.last_used_at > before);
        assert!(kv.get_owner("cid-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_absent_returns_false() {
        let kv = MemoryKv::new();
        assert!(!kv.refresh_ttl(&key("a", "s"), TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_tombstones() {
        let kv = MemoryKv::new();
        let k = key("alice", "s1");
        assert!(!kv.is_destroyed(&k).await.unwrap());

        kv.mark_destroyed(&k, TTL).await.unwrap();
        assert!(kv.is_destroyed(&k).await.unwrap());

        kv.clear_destroyed(&k).await.unwrap();
        assert!(!kv.is_destroyed(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_tombstone_expires() {
        let kv = MemoryKv::new();
        let k = key("alice", "s1");
        kv.mark_destroyed(&k, Duration::from_millis(5)).await.unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!kv.is_destroyed(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let kv = MemoryKv::new();
        kv.put_session(&key("a", "s1"), SessionRecord::new("c1", None), TTL)
            .await
            .unwrap();
        kv.put_session(&key("b", "s1"), SessionRecord::new("c2", None), TTL)
            .await
            .unwrap();

        let mut sessions = kv.list_sessions().await.unwrap();
        sessions.sort_by(|a, b| a.1.container_id.cmp(&b.1.container_id));
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].1.container_id, "c1");
        assert_eq!(sessions[1].0.user_id, "b");
    }

    #[tokio::test]
    async fn test_rate_counter_increments() {
        let kv = MemoryKv::new();
        let window = Duration::from_secs(60);
        assert_eq!(kv.incr_rate_counter("alice", window).await.unwrap(), 1);
        assert_eq!(kv.incr_rate_counter("alice", window).await.unwrap(), 2);
        assert_eq!(kv.incr_rate_counter("bob", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_session_id_different_users_do_not_collide() {
        let kv = MemoryKv::new();
        kv.put_session(&key("u1", "shared"), SessionRecord::new("c1", None), TTL)
            .await
            .unwrap();
        kv.put_session(&key("u2", "shared"), SessionRecord::new("c2", None), TTL)
            .await
            .unwrap();

        let r1 = kv.get_session(&key("u1", "shared")).await.unwrap().unwrap();
        let r2 = kv.get_session(&key("u2", "shared")).await.unwrap().unwrap();
        assert_ne!(r1.container_id, r2.container_id);
    }
}
