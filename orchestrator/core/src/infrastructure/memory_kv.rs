// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # In-Memory Key-Value Backend
//!
//! Development/testing implementation of the
//! [`KeyValueStore`](crate::infrastructure::kv::KeyValueStore) port.
//! Versioned entries, sets, lists, counters and lease locks live in
//! dashmap shards; pub/sub rides tokio broadcast channels. Expiry is
//! lazy — checked on access, no background reaper tasks.
//!
//! Compare-and-swap correctness relies on the dashmap entry API holding
//! the shard lock for the whole read-check-write.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::infrastructure::kv::{KeyValueStore, KvError, VersionedValue, WriteCondition};

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    version: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    deadline: DateTime<Utc>,
}

/// In-memory backend. Cheap to clone-by-Arc and safe to share between
/// services in one process; cross-process deployments need a networked
/// backend implementing the same port.
pub struct InMemoryKeyValueStore {
    entries: DashMap<String, Entry>,
    sets: DashMap<String, BTreeSet<String>>,
    lists: DashMap<String, Vec<serde_json::Value>>,
    counters: DashMap<String, i64>,
    locks: DashMap<String, LockEntry>,
    channels: DashMap<String, broadcast::Sender<serde_json::Value>>,
    channel_capacity: usize,
}

impl InMemoryKeyValueStore {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            sets: DashMap::new(),
            lists: DashMap::new(),
            counters: DashMap::new(),
            locks: DashMap::new(),
            channels: DashMap::new(),
            channel_capacity,
        }
    }

    fn ttl_deadline(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| Utc::now() + d)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<serde_json::Value> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, KvError> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(VersionedValue {
                value: entry.value.clone(),
                version: entry.version,
            }));
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
        ttl: Option<Duration>,
    ) -> Result<u64, KvError> {
        let now = Utc::now();
        let expires_at = Self::ttl_deadline(ttl);
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    // Expired entries behave as absent.
                    match condition {
                        WriteCondition::VersionEquals(expected) => {
                            occupied.remove();
                            return Err(KvError::VersionConflict {
                                key: key.to_string(),
                                expected,
                                actual: 0,
                            });
                        }
                        WriteCondition::Any | WriteCondition::Absent => {
                            occupied.insert(Entry {
                                value,
                                version: 1,
                                expires_at,
                            });
                            return Ok(1);
                        }
                    }
                }
                let current = occupied.get().version;
                match condition {
                    WriteCondition::Absent => Err(KvError::VersionConflict {
                        key: key.to_string(),
                        expected: 0,
                        actual: current,
                    }),
                    WriteCondition::VersionEquals(expected) if expected != current => {
                        Err(KvError::VersionConflict {
                            key: key.to_string(),
                            expected,
                            actual: current,
                        })
                    }
                    WriteCondition::Any | WriteCondition::VersionEquals(_) => {
                        let next = current + 1;
                        occupied.insert(Entry {
                            value,
                            version: next,
                            expires_at,
                        });
                        Ok(next)
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => match condition {
                WriteCondition::VersionEquals(expected) => Err(KvError::VersionConflict {
                    key: key.to_string(),
                    expected,
                    actual: 0,
                }),
                WriteCondition::Any | WriteCondition::Absent => {
                    vacant.insert(Entry {
                        value,
                        version: 1,
                        expires_at,
                    });
                    Ok(1)
                }
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Utc::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.entries.remove(key);
                return Ok(false);
            }
            entry.expires_at = Self::ttl_deadline(Some(ttl));
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, KvError> {
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, KvError> {
        Ok(self
            .sets
            .get_mut(key)
            .map(|mut set| set.remove(member))
            .unwrap_or(false))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_append(&self, key: &str, value: serde_json::Value) -> Result<u64, KvError> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push(value);
        Ok(list.len() as u64)
    }

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        end: Option<usize>,
    ) -> Result<Vec<serde_json::Value>, KvError> {
        Ok(self
            .lists
            .get(key)
            .map(|list| {
                let end = end.unwrap_or(list.len()).min(list.len());
                if start >= end {
                    Vec::new()
                } else {
                    list[start..end].to_vec()
                }
            })
            .unwrap_or_default())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, KvError> {
        let mut counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter = counter.saturating_add(by);
        Ok(*counter)
    }

    async fn try_lock(&self, name: &str, holder: &str, lease: Duration) -> Result<bool, KvError> {
        let now = Utc::now();
        let deadline = now
            + ChronoDuration::from_std(lease)
                .map_err(|e| KvError::Backend(format!("lease out of range: {e}")))?;
        match self.locks.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.deadline > now && current.holder != holder {
                    return Ok(false);
                }
                if current.deadline <= now {
                    debug!(lock = %name, previous = %current.holder, "stealing expired lock lease");
                }
                occupied.insert(LockEntry {
                    holder: holder.to_string(),
                    deadline,
                });
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    holder: holder.to_string(),
                    deadline,
                });
                Ok(true)
            }
        }
    }

    async fn unlock(&self, name: &str, holder: &str) -> Result<bool, KvError> {
        Ok(self
            .locks
            .remove_if(name, |_, entry| entry.holder == holder)
            .is_some())
    }

    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<usize, KvError> {
        let sender = self.sender(channel);
        Ok(sender.send(payload).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value> {
        self.sender(channel).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_versioning() {
        let store = InMemoryKeyValueStore::default();
        let v1 = store
            .put("k", json!({"a": 1}), WriteCondition::Absent, None)
            .await
            .unwrap();
        assert_eq!(v1, 1);
        let v2 = store
            .put("k", json!({"a": 2}), WriteCondition::VersionEquals(1), None)
            .await
            .unwrap();
        assert_eq!(v2, 2);
        let read = store.get("k").await.unwrap().unwrap();
        assert_eq!(read.version, 2);
        assert_eq!(read.value, json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_cas_conflict() {
        let store = InMemoryKeyValueStore::default();
        store
            .put("k", json!(1), WriteCondition::Absent, None)
            .await
            .unwrap();
        let err = store
            .put("k", json!(2), WriteCondition::VersionEquals(9), None)
            .await
            .unwrap_err();
        match err {
            KvError::VersionConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 9);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The losing write must not have changed anything.
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn test_absent_condition_rejects_existing() {
        let store = InMemoryKeyValueStore::default();
        store
            .put("k", json!(1), WriteCondition::Any, None)
            .await
            .unwrap();
        assert!(store
            .put("k", json!(2), WriteCondition::Absent, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let store = InMemoryKeyValueStore::default();
        store
            .put(
                "k",
                json!(1),
                WriteCondition::Any,
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
        // An expired key behaves as absent for CAS writes.
        let err = store
            .put("k", json!(2), WriteCondition::VersionEquals(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::VersionConflict { actual: 0, .. }));
    }

    #[tokio::test]
    async fn test_sets_and_lists() {
        let store = InMemoryKeyValueStore::default();
        assert!(store.set_add("runs", "a").await.unwrap());
        assert!(!store.set_add("runs", "a").await.unwrap());
        store.set_add("runs", "b").await.unwrap();
        assert_eq!(store.set_members("runs").await.unwrap().len(), 2);
        assert!(store.set_remove("runs", "a").await.unwrap());
        assert!(!store.set_remove("runs", "a").await.unwrap());

        store.list_append("log", json!("first")).await.unwrap();
        let len = store.list_append("log", json!("second")).await.unwrap();
        assert_eq!(len, 2);
        let range = store.list_range("log", 0, None).await.unwrap();
        assert_eq!(range, vec![json!("first"), json!("second")]);
        let tail = store.list_range("log", 1, None).await.unwrap();
        assert_eq!(tail, vec![json!("second")]);
    }

    #[tokio::test]
    async fn test_incr() {
        let store = InMemoryKeyValueStore::default();
        assert_eq!(store.incr("c", 1).await.unwrap(), 1);
        assert_eq!(store.incr("c", 2).await.unwrap(), 3);
        assert_eq!(store.incr("c", 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_lock_mutual_exclusion_and_lease_steal() {
        let store = InMemoryKeyValueStore::default();
        assert!(store
            .try_lock("l", "holder-1", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!store
            .try_lock("l", "holder-2", Duration::from_secs(10))
            .await
            .unwrap());
        // Same holder refreshes its own lease.
        assert!(store
            .try_lock("l", "holder-1", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Lease expired; a new holder may steal the lock.
        assert!(store
            .try_lock("l", "holder-2", Duration::from_secs(10))
            .await
            .unwrap());
        // Release by the old holder is a safe no-op now.
        assert!(!store.unlock("l", "holder-1").await.unwrap());
        assert!(store.unlock("l", "holder-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = InMemoryKeyValueStore::default();
        let mut receiver = store.subscribe("events");
        store.publish("events", json!({"v": 1})).await.unwrap();
        store.publish("events", json!({"v": 2})).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), json!({"v": 1}));
        assert_eq!(receiver.recv().await.unwrap(), json!({"v": 2}));
    }
}
