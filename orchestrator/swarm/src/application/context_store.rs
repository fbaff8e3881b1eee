// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Context Manager (Application Service)
//!
//! Owns the versioned, persisted resource pool for each swarm and every
//! operation that mutates it: hierarchical allocation/release, generic
//! context updates, distributed locks, rendezvous barriers and change
//! subscriptions.
//!
//! ## Concurrency model
//!
//! All mutations go through one bounded compare-and-swap loop keyed on the
//! context `version`: read, apply a pure domain mutation, write with
//! `VersionEquals`, and on conflict back off (capped exponential) and
//! retry up to the configured attempt ceiling, after which the caller gets
//! `ConcurrentModification`. Subscribers are notified strictly after the
//! commit lands (commit-then-notify), so no callback can re-enter a
//! mutation of the same version.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hive_core::domain::config::{EngineConfig, RetryPolicy};
use hive_core::domain::context::{
    AllocationPolicy, ContextChangeType, ContextPatch, ContextUpdateEvent, SwarmContext, SwarmId,
};
use hive_core::domain::events::ResourceEvent;
use hive_core::domain::resources::{
    Allocation, AllocationId, ResourceError, ResourceQuantity, ResourceRequest, ResourceUsage,
};
use hive_core::infrastructure::event_bus::EventBus;
use hive_core::infrastructure::kv::{KeyValueStore, KvError, WriteCondition};

/// Context store failure taxonomy.
#[derive(Debug, Error)]
pub enum ContextStoreError {
    #[error("swarm {swarm_id} not found")]
    SwarmNotFound { swarm_id: SwarmId },

    #[error("swarm {swarm_id} already exists")]
    SwarmAlreadyExists { swarm_id: SwarmId },

    /// The mutated context failed invariant validation; nothing was
    /// persisted.
    #[error("refusing to persist invalid swarm context: {errors:?}")]
    InvalidContext { errors: Vec<String> },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

fn context_key(swarm_id: SwarmId) -> String {
    format!("swarm:{swarm_id}:context")
}

fn updates_channel(swarm_id: SwarmId) -> String {
    format!("swarm:{swarm_id}:updates")
}

fn lock_name(swarm_id: SwarmId, resource: &str) -> String {
    format!("swarm:{swarm_id}:lock:{resource}")
}

fn barrier_key(swarm_id: SwarmId, name: &str) -> String {
    format!("swarm:{swarm_id}:barrier:{name}")
}

/// Application service owning swarm context persistence and coordination.
pub struct SwarmContextManager {
    kv: Arc<dyn KeyValueStore>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    lock_lease: Duration,
    barrier_timeout: Duration,
    /// Stable identity of this manager instance for lock leases.
    holder_id: String,
}

impl SwarmContextManager {
    pub fn new(kv: Arc<dyn KeyValueStore>, bus: Arc<EventBus>, config: &EngineConfig) -> Self {
        Self {
            kv,
            bus,
            retry: config.cas_retry.clone(),
            lock_lease: config.lock_lease,
            barrier_timeout: config.barrier_timeout,
            holder_id: format!("ctxmgr-{}", Uuid::new_v4()),
        }
    }

    // ========================================================================
    // Swarm lifecycle
    // ========================================================================

    /// Create a swarm with its full pool available.
    pub async fn create_swarm(
        &self,
        swarm_id: SwarmId,
        total: ResourceQuantity,
        policy: AllocationPolicy,
    ) -> Result<SwarmContext, ContextStoreError> {
        let context = SwarmContext::new(swarm_id, total, policy);
        let value = serde_json::to_value(&context).map_err(KvError::from)?;
        match self
            .kv
            .put(&context_key(swarm_id), value, WriteCondition::Absent, None)
            .await
        {
            Ok(_) => {}
            Err(KvError::VersionConflict { .. }) => {
                return Err(ContextStoreError::SwarmAlreadyExists { swarm_id });
            }
            Err(e) => return Err(e.into()),
        }
        info!(swarm_id = %swarm_id, credits = %total.credits, "swarm created");
        self.notify(
            swarm_id,
            ContextChangeType::Created,
            vec!["total".to_string()],
            context.version,
        )
        .await;
        Ok(context)
    }

    pub async fn get_context(&self, swarm_id: SwarmId) -> Result<SwarmContext, ContextStoreError> {
        let Some(stored) = self.kv.get(&context_key(swarm_id)).await? else {
            return Err(ContextStoreError::SwarmNotFound { swarm_id });
        };
        let context: SwarmContext =
            serde_json::from_value(stored.value).map_err(KvError::from)?;
        Ok(context)
    }

    // ========================================================================
    // Allocation / release
    // ========================================================================

    /// Atomically allocate from the swarm pool.
    ///
    /// A request exceeding `available` in any dimension fails fast with
    /// `InsufficientResource` (no partial grants); CAS conflicts are
    /// retried internally up to the configured ceiling.
    pub async fn allocate_resources(
        &self,
        swarm_id: SwarmId,
        request: ResourceRequest,
    ) -> Result<Allocation, ContextStoreError> {
        let result = self
            .commit(swarm_id, ContextChangeType::Allocated, |current| {
                let expires_at = allocation_expiry(current, &request);
                let (next, allocation) = current.with_allocation(&request, expires_at)?;
                Ok(Some((
                    next,
                    vec!["available".to_string(), "allocations".to_string()],
                    allocation,
                )))
            })
            .await;

        match result {
            Ok(Some(allocation)) => {
                metrics::counter!("hive_allocations_granted_total").increment(1);
                info!(
                    swarm_id = %swarm_id,
                    allocation_id = %allocation.allocation_id,
                    consumer = %allocation.consumer_id,
                    credits = %allocation.allocated.credits,
                    "resources allocated"
                );
                self.bus
                    .publish_resource_event(ResourceEvent::ResourceAllocated {
                        swarm_id,
                        allocation_id: allocation.allocation_id,
                        consumer_id: allocation.consumer_id.clone(),
                        consumer_type: allocation.consumer_type,
                        allocated: allocation.allocated,
                        allocated_at: allocation.allocated_at,
                    })
                    .await;
                Ok(allocation)
            }
            Ok(None) => unreachable!("allocation commit never no-ops"),
            Err(ContextStoreError::Resource(ResourceError::InsufficientResource {
                resource,
                requested,
                available,
            })) => {
                metrics::counter!("hive_allocations_rejected_total").increment(1);
                warn!(
                    swarm_id = %swarm_id,
                    %resource,
                    requested,
                    available,
                    "allocation rejected: insufficient resources"
                );
                self.bus
                    .publish_resource_event(ResourceEvent::ResourceExhausted {
                        swarm_id,
                        resource,
                        requested,
                        available,
                        observed_at: Utc::now(),
                    })
                    .await;
                Err(ResourceError::InsufficientResource {
                    resource,
                    requested,
                    available,
                }
                .into())
            }
            Err(e) => Err(e),
        }
    }

    /// Admit a batch of requests in one committed mutation, granting in the
    /// swarm's configured order (arrival or priority) until the pool runs
    /// out. Results are returned in the caller's original order.
    pub async fn allocate_batch(
        &self,
        swarm_id: SwarmId,
        requests: Vec<ResourceRequest>,
    ) -> Result<Vec<Result<Allocation, ResourceError>>, ContextStoreError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let outcome = self
            .commit(swarm_id, ContextChangeType::Allocated, |current| {
                let mut order: Vec<usize> = (0..requests.len()).collect();
                order.sort_by_key(|&i| current.grant_rank(&requests[i], i));

                let mut context = current.clone();
                let mut results: Vec<Option<Result<Allocation, ResourceError>>> =
                    vec![None; requests.len()];
                let mut granted = 0u32;
                for i in order {
                    let request = &requests[i];
                    let expires_at = allocation_expiry(&context, request);
                    match context.with_allocation(request, expires_at) {
                        Ok((next, allocation)) => {
                            context = next;
                            granted += 1;
                            results[i] = Some(Ok(allocation));
                        }
                        Err(e) => results[i] = Some(Err(e)),
                    }
                }
                if granted == 0 {
                    // Nothing fit; report rejections without a version bump.
                    let results: Vec<_> = results.into_iter().map(Option::unwrap).collect();
                    return Ok(Some((current.clone(), Vec::new(), (results, false))));
                }
                let results: Vec<_> = results.into_iter().map(Option::unwrap).collect();
                Ok(Some((
                    context,
                    vec!["available".to_string(), "allocations".to_string()],
                    (results, true),
                )))
            })
            .await?;

        let Some((results, committed)) = outcome else {
            unreachable!("batch commit never returns a bare no-op");
        };
        if committed {
            for result in results.iter().flatten() {
                self.bus
                    .publish_resource_event(ResourceEvent::ResourceAllocated {
                        swarm_id,
                        allocation_id: result.allocation_id,
                        consumer_id: result.consumer_id.clone(),
                        consumer_type: result.consumer_type,
                        allocated: result.allocated,
                        allocated_at: result.allocated_at,
                    })
                    .await;
            }
        }
        Ok(results)
    }

    /// Release a committed allocation.
    ///
    /// Reported usage is retired from the pool (consumed credits and
    /// elapsed time never return); the unused remainder flows back to
    /// `available`. Idempotent: releasing an unknown (or already released)
    /// id is a warn-level no-op returning `None`, and performs no mutation.
    pub async fn release_resources(
        &self,
        swarm_id: SwarmId,
        allocation_id: AllocationId,
        usage: Option<ResourceUsage>,
    ) -> Result<Option<ResourceQuantity>, ContextStoreError> {
        let usage = usage.unwrap_or_default();
        let released = self
            .commit(swarm_id, ContextChangeType::Released, |current| {
                match current.without_allocation(allocation_id, &usage)? {
                    Some((next, removed, returned)) => Ok(Some((
                        next,
                        vec![
                            "total".to_string(),
                            "available".to_string(),
                            "allocations".to_string(),
                        ],
                        (removed, returned),
                    ))),
                    None => Ok(None),
                }
            })
            .await?;

        match released {
            Some((allocation, returned)) => {
                metrics::counter!("hive_allocations_released_total").increment(1);
                info!(
                    swarm_id = %swarm_id,
                    allocation_id = %allocation_id,
                    allocated = %allocation.allocated.credits,
                    returned = %returned.credits,
                    "resources released"
                );
                self.bus
                    .publish_resource_event(ResourceEvent::ResourceReleased {
                        swarm_id,
                        allocation_id,
                        returned,
                        released_at: Utc::now(),
                    })
                    .await;
                Ok(Some(returned))
            }
            None => {
                warn!(
                    swarm_id = %swarm_id,
                    allocation_id = %allocation_id,
                    "release of unknown allocation ignored"
                );
                Ok(None)
            }
        }
    }

    /// Versioned merge of configuration/blackboard/execution-state.
    /// Always increments `version` and stamps `last_updated`.
    pub async fn update_context(
        &self,
        swarm_id: SwarmId,
        patch: ContextPatch,
    ) -> Result<u64, ContextStoreError> {
        let version = self
            .commit(swarm_id, ContextChangeType::Updated, |current| {
                let (next, changed) = current.with_patch(&patch);
                let version = next.version;
                Ok(Some((next, changed, version)))
            })
            .await?;
        Ok(version.expect("context update always commits"))
    }

    /// Release every allocation past its expiry. Returns how many were
    /// reclaimed.
    pub async fn sweep_expired_allocations(
        &self,
        swarm_id: SwarmId,
    ) -> Result<usize, ContextStoreError> {
        let swept = self
            .commit(swarm_id, ContextChangeType::Swept, |current| {
                let now = Utc::now();
                let expired = current.expired_allocations(now);
                if expired.is_empty() {
                    return Ok(None);
                }
                let mut context = current.clone();
                let mut reclaimed = Vec::new();
                for id in expired {
                    // A swept allocation reported no usage; everything
                    // returns. Each removal bumps the version; collapse to
                    // one commit.
                    if let Some((next, removed, _)) =
                        context.without_allocation(id, &ResourceUsage::default())?
                    {
                        let mut next = next;
                        next.version = context.version;
                        reclaimed.push(removed);
                        context = next;
                    }
                }
                context.version = current.version + 1;
                Ok(Some((
                    context,
                    vec!["available".to_string(), "allocations".to_string()],
                    reclaimed,
                )))
            })
            .await?;

        let reclaimed = swept.unwrap_or_default();
        for allocation in &reclaimed {
            warn!(
                swarm_id = %swarm_id,
                allocation_id = %allocation.allocation_id,
                consumer = %allocation.consumer_id,
                "expired allocation swept back into the pool"
            );
            self.bus
                .publish_resource_event(ResourceEvent::AllocationExpired {
                    swarm_id,
                    allocation_id: allocation.allocation_id,
                    reclaimed: allocation.allocated,
                    expired_at: Utc::now(),
                })
                .await;
        }
        Ok(reclaimed.len())
    }

    // ========================================================================
    // Locks, barriers, subscriptions
    // ========================================================================

    /// Try to take the named swarm-scoped lock.
    ///
    /// Mutually exclusive across every process sharing the backend; the
    /// lease bounds how long a crashed holder can block others.
    pub async fn try_acquire_lock(
        &self,
        swarm_id: SwarmId,
        resource: &str,
    ) -> Result<Option<DistributedLock>, ContextStoreError> {
        let name = lock_name(swarm_id, resource);
        let acquired = self
            .kv
            .try_lock(&name, &self.holder_id, self.lock_lease)
            .await?;
        if !acquired {
            debug!(lock = %name, "lock busy");
            return Ok(None);
        }
        Ok(Some(DistributedLock {
            kv: Arc::clone(&self.kv),
            name,
            holder: self.holder_id.clone(),
            lock_id: Uuid::new_v4(),
            released: AtomicBool::new(false),
        }))
    }

    /// Create a rendezvous barrier for `expected_count` participants.
    pub fn create_barrier(
        &self,
        swarm_id: SwarmId,
        name: &str,
        expected_count: u64,
    ) -> Barrier {
        Barrier {
            kv: Arc::clone(&self.kv),
            counter_key: barrier_key(swarm_id, name),
            channel: format!("{}:released", barrier_key(swarm_id, name)),
            expected_count,
            default_timeout: self.barrier_timeout,
        }
    }

    /// Subscribe to this swarm's committed context updates.
    ///
    /// Events arrive exactly once per commit, in commit order. Dropping the
    /// subscription (or calling [`ContextSubscription::unsubscribe`])
    /// guarantees no further delivery.
    pub fn subscribe(&self, swarm_id: SwarmId) -> ContextSubscription {
        ContextSubscription {
            receiver: self.kv.subscribe(&updates_channel(swarm_id)),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Bounded CAS commit loop. The closure maps the current context to
    /// `Some((next, changed_paths, output))`, or `None` for an explicit
    /// no-op (nothing written, nobody notified).
    async fn commit<T, F>(
        &self,
        swarm_id: SwarmId,
        change_type: ContextChangeType,
        mutate: F,
    ) -> Result<Option<T>, ContextStoreError>
    where
        F: Fn(&SwarmContext) -> Result<Option<(SwarmContext, Vec<String>, T)>, ContextStoreError>,
    {
        let key = context_key(swarm_id);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let current = self.get_context(swarm_id).await?;
            let Some((next, changed_paths, output)) = mutate(&current)? else {
                return Ok(None);
            };
            if next.version == current.version {
                // Mutation chose not to bump; treat as no-op with output.
                return Ok(Some(output));
            }

            let report = next.validate();
            if !report.is_valid {
                return Err(ContextStoreError::InvalidContext {
                    errors: report.errors,
                });
            }

            let value = serde_json::to_value(&next).map_err(KvError::from)?;
            match self
                .kv
                .put(
                    &key,
                    value,
                    WriteCondition::VersionEquals(current.version),
                    None,
                )
                .await
            {
                Ok(_) => {
                    self.notify(swarm_id, change_type, changed_paths, next.version)
                        .await;
                    return Ok(Some(output));
                }
                Err(KvError::VersionConflict { .. }) => {
                    metrics::counter!("hive_context_cas_conflicts_total").increment(1);
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            swarm_id = %swarm_id,
                            attempts = attempt,
                            "context commit lost every CAS attempt"
                        );
                        return Err(ResourceError::ConcurrentModification {
                            swarm_id,
                            attempts: attempt,
                        }
                        .into());
                    }
                    let delay = self.retry.delay_before(attempt + 1);
                    debug!(
                        swarm_id = %swarm_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "context commit conflicted; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Commit-then-notify: failures here are logged, never propagated — the
    /// mutation has already committed.
    async fn notify(
        &self,
        swarm_id: SwarmId,
        change_type: ContextChangeType,
        changed_paths: Vec<String>,
        new_version: u64,
    ) {
        let event = ContextUpdateEvent {
            swarm_id,
            change_type,
            changed_paths,
            new_version,
        };
        match serde_json::to_value(&event) {
            Ok(payload) => {
                if let Err(e) = self.kv.publish(&updates_channel(swarm_id), payload).await {
                    warn!(swarm_id = %swarm_id, error = %e, "failed to notify context subscribers");
                }
            }
            Err(e) => warn!(swarm_id = %swarm_id, error = %e, "failed to encode context update"),
        }
    }
}

/// Expiry applied to a new allocation: the requested time budget when one
/// was given, else the swarm policy default, else unbounded.
fn allocation_expiry(
    context: &SwarmContext,
    request: &ResourceRequest,
) -> Option<chrono::DateTime<Utc>> {
    let ttl_ms = if request.limits.time_budget_ms > 0 {
        Some(request.limits.time_budget_ms)
    } else {
        context.policy.default_allocation_ttl_ms
    };
    ttl_ms.map(|ms| Utc::now() + ChronoDuration::milliseconds(ms as i64))
}

/// A held distributed lock. Release is explicit and idempotent; a lease
/// that expires out from under a crashed holder frees the lock for the
/// next acquirer, and a late `release()` from the old holder is a no-op.
pub struct DistributedLock {
    kv: Arc<dyn KeyValueStore>,
    name: String,
    holder: String,
    lock_id: Uuid,
    released: AtomicBool,
}

impl DistributedLock {
    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock. Safe to call repeatedly and after lease expiry.
    pub async fn release(&self) -> Result<(), KvError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let was_held = self.kv.unlock(&self.name, &self.holder).await?;
        if !was_held {
            debug!(lock = %self.name, "release after lease expiry; nothing to do");
        }
        Ok(())
    }
}

/// A rendezvous barrier shared by `expected_count` participants.
pub struct Barrier {
    kv: Arc<dyn KeyValueStore>,
    counter_key: String,
    channel: String,
    expected_count: u64,
    default_timeout: Duration,
}

/// Barrier failure taxonomy.
#[derive(Debug, Error)]
pub enum BarrierError {
    /// Arrived after the barrier already released; the caller must create
    /// a new barrier for another rendezvous.
    #[error("barrier already released; create a new barrier")]
    AlreadyReleased,

    #[error("timed out after {0:?} waiting for barrier release")]
    TimedOut(Duration),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl Barrier {
    /// Arrive and wait for release with the engine's default timeout.
    pub async fn arrive(&self) -> Result<(), BarrierError> {
        self.arrive_timeout(self.default_timeout).await
    }

    /// Arrive and wait at most `timeout` for the final participant.
    ///
    /// The shared counter increments atomically; the arrival that reaches
    /// `expected_count` publishes the release exactly once and returns
    /// immediately, all earlier arrivals wake on that notification.
    pub async fn arrive_timeout(&self, timeout: Duration) -> Result<(), BarrierError> {
        // Subscribe before counting so the release cannot slip past us.
        let mut receiver = self.kv.subscribe(&self.channel);
        let count = self.kv.incr(&self.counter_key, 1).await? as u64;
        if count > self.expected_count {
            return Err(BarrierError::AlreadyReleased);
        }
        if count == self.expected_count {
            self.kv
                .publish(&self.channel, json!({ "released_at_count": count }))
                .await?;
            return Ok(());
        }
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                // Missed intermediate messages; the release already fired.
                Ok(())
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                Err(KvError::Backend("barrier channel closed".to_string()).into())
            }
            Err(_) => Err(BarrierError::TimedOut(timeout)),
        }
    }

    pub async fn current_count(&self) -> Result<u64, BarrierError> {
        Ok(self.kv.incr(&self.counter_key, 0).await? as u64)
    }

    pub async fn is_released(&self) -> Result<bool, BarrierError> {
        Ok(self.current_count().await? >= self.expected_count)
    }
}

/// Active subscription to one swarm's context updates.
pub struct ContextSubscription {
    receiver: broadcast::Receiver<serde_json::Value>,
}

/// Subscription failure taxonomy.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription channel closed")]
    Closed,

    #[error("subscriber lagged by {0} events (events were dropped)")]
    Lagged(u64),

    #[error("failed to decode context update: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ContextSubscription {
    /// Receive the next committed update, in commit order.
    pub async fn recv(&mut self) -> Result<ContextUpdateEvent, SubscriptionError> {
        let payload = self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => SubscriptionError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("context subscriber lagged by {} events", n);
                SubscriptionError::Lagged(n)
            }
        })?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Drop the subscription; no further events are delivered after this
    /// returns.
    pub fn unsubscribe(self) {}
}
