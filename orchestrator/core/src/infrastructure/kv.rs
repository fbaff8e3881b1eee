// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Key-Value Store Port
//!
//! Persistence/transport contract the coordination engine is written
//! against. Any backend offering these operations works: a versioned
//! read/compare-and-swap primitive (optimistic concurrency), set
//! membership (run indices), ordered-list append/read (history and
//! checkpoint indices), key expiry, a lock primitive with lease expiry,
//! and publish/subscribe for change notification.
//!
//! Interface defined here, implementations in
//! [`memory_kv`](crate::infrastructure::memory_kv) (development/testing);
//! production backends are selected at deployment time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// A stored value together with its commit version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: serde_json::Value,
    /// 1 on creation, +1 per committed write.
    pub version: u64,
}

/// Precondition attached to a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional write (create or replace).
    Any,
    /// Create only; fails with `VersionConflict` if the key exists.
    Absent,
    /// Replace only if the current version matches (compare-and-swap).
    VersionEquals(u64),
}

/// Key-value backend failures.
#[derive(Debug, Error)]
pub enum KvError {
    /// A conditional write observed a different version than expected.
    /// `actual == 0` means the key did not exist.
    #[error("version conflict on '{key}': expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("key not found: '{key}'")]
    NotFound { key: String },

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// The persistence/transport collaborator.
///
/// All operations are subject to backend latency; callers apply their own
/// call-level timeouts.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key with its version. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, KvError>;

    /// Conditional write. Returns the committed version.
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
        ttl: Option<Duration>,
    ) -> Result<u64, KvError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Refresh a key's TTL. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Add to a set. Returns whether the member was newly inserted.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, KvError>;

    /// Remove from a set. Returns whether the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError>;

    /// Append to an ordered list. Returns the new length.
    async fn list_append(&self, key: &str, value: serde_json::Value) -> Result<u64, KvError>;

    /// Read `[start, end)` of an ordered list; `end = None` reads to the
    /// tail.
    async fn list_range(
        &self,
        key: &str,
        start: usize,
        end: Option<usize>,
    ) -> Result<Vec<serde_json::Value>, KvError>;

    /// Atomically add `by` to a counter (creating it at 0). Returns the new
    /// value; `by = 0` reads without modifying.
    async fn incr(&self, key: &str, by: i64) -> Result<i64, KvError>;

    /// Try to take a named lock for `holder` with a lease. Returns false if
    /// another holder owns an unexpired lease. Re-acquisition by the same
    /// holder refreshes the lease.
    async fn try_lock(&self, name: &str, holder: &str, lease: Duration) -> Result<bool, KvError>;

    /// Release a named lock if still held by `holder`. Returns whether the
    /// lock was released; releasing an expired or foreign lock is a no-op.
    async fn unlock(&self, name: &str, holder: &str) -> Result<bool, KvError>;

    /// Publish to a channel. Returns the number of live subscribers.
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<usize, KvError>;

    /// Subscribe to a channel. Dropping the receiver unsubscribes.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value>;
}
