// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Context Aggregate
//!
//! The versioned, shared state of one swarm: its resource pool, live
//! allocations, blackboard and execution metadata.
//!
//! - [`SwarmContext`] — aggregate root. All mutations are pure: they return
//!   a new context with `version + 1`, leaving commit (and conflict
//!   detection) to the context store.
//! - [`ContextValidation`] — invariant check report, used defensively
//!   before persisting and directly in tests.
//! - [`ContextUpdateEvent`] — what subscribers observe after each commit.
//!
//! # Invariants
//!
//! - `available = total − Σ allocations.allocated` at every version.
//! - `version` increments exactly once per committed mutation.
//! - Quantities never go negative (enforced by the checked ledger math).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::resources::{
    Allocation, AllocationId, AllocationPriority, ResourceError, ResourceQuantity, ResourceRequest,
    ResourceUsage,
};

/// Unique identifier for a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwarmId(pub Uuid);

impl SwarmId {
    /// Generate a new random `SwarmId`.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SwarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SwarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse lifecycle state of the swarm as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmExecutionState {
    #[default]
    Forming,
    Active,
    /// No new allocations admitted; existing runs drain out.
    Draining,
    Dissolved,
}

/// How concurrent allocation requests are ordered when granted as a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantOrder {
    #[default]
    Arrival,
    Priority,
}

/// Per-swarm allocation policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationPolicy {
    #[serde(default)]
    pub grant_order: GrantOrder,
    /// Applied when a request carries no duration of its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_allocation_ttl_ms: Option<u64>,
}

/// Aggregate root for one swarm's shared resource pool and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmContext {
    pub swarm_id: SwarmId,
    /// Monotonically increasing; the optimistic-concurrency token.
    pub version: u64,
    pub total: ResourceQuantity,
    pub available: ResourceQuantity,
    /// Live reservations, in grant order.
    pub allocations: Vec<Allocation>,
    pub policy: AllocationPolicy,
    /// Arbitrary configuration visible to every run in the swarm.
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
    /// Shared scratch state for cooperating runs.
    #[serde(default)]
    pub blackboard: HashMap<String, serde_json::Value>,
    pub execution_state: SwarmExecutionState,
    pub last_updated: DateTime<Utc>,
}

impl SwarmContext {
    /// Create a fresh context with the whole pool available.
    pub fn new(swarm_id: SwarmId, total: ResourceQuantity, policy: AllocationPolicy) -> Self {
        Self {
            swarm_id,
            version: 1,
            total,
            available: total,
            allocations: Vec::new(),
            policy,
            configuration: HashMap::new(),
            blackboard: HashMap::new(),
            execution_state: SwarmExecutionState::Forming,
            last_updated: Utc::now(),
        }
    }

    pub fn find_allocation(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.allocation_id == id)
    }

    /// Pure grant: returns the successor context plus the new allocation.
    ///
    /// Fails fast with `InsufficientResource` when any requested dimension
    /// exceeds `available`; no partial or best-effort grants.
    pub fn with_allocation(
        &self,
        request: &ResourceRequest,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(Self, Allocation), ResourceError> {
        let available = self.available.checked_sub(&request.limits)?;
        let allocation = Allocation::from_request(request, expires_at);
        let mut next = self.clone();
        next.available = available;
        next.allocations.push(allocation.clone());
        next.bump();
        Ok((next, allocation))
    }

    /// Pure release: returns the successor context, the removed allocation
    /// and the quantity that flowed back into `available`, or `None` when
    /// the id is unknown (idempotent release).
    ///
    /// Reported usage is retired from the pool: consumed credits and
    /// elapsed time shrink `total` instead of returning to `available`
    /// (clamped to the allocation, so an over-reporting consumer cannot
    /// drain the pool). Memory and concurrency slots were held, not
    /// consumed, and always return in full.
    pub fn without_allocation(
        &self,
        id: AllocationId,
        usage: &ResourceUsage,
    ) -> Result<Option<(Self, Allocation, ResourceQuantity)>, ResourceError> {
        let Some(index) = self.allocations.iter().position(|a| a.allocation_id == id) else {
            return Ok(None);
        };
        let mut next = self.clone();
        let allocation = next.allocations.remove(index);

        let consumed = ResourceQuantity {
            credits: usage.credits_used.min(allocation.allocated.credits),
            time_budget_ms: usage.elapsed_ms.min(allocation.allocated.time_budget_ms),
            memory_mb: 0,
            concurrency_slots: 0,
        };
        let returned = allocation.allocated.checked_sub(&consumed)?;
        next.total = next.total.checked_sub(&consumed)?;
        next.available = next.available.checked_add(&returned)?;
        next.bump();
        Ok(Some((next, allocation, returned)))
    }

    /// Pure merge of a partial update. Returns the successor context and
    /// the dotted paths that changed (for subscriber notification).
    pub fn with_patch(&self, patch: &ContextPatch) -> (Self, Vec<String>) {
        let mut next = self.clone();
        let mut changed = Vec::new();
        if let Some(configuration) = &patch.configuration {
            for (key, value) in configuration {
                next.configuration.insert(key.clone(), value.clone());
                changed.push(format!("configuration.{key}"));
            }
        }
        if let Some(blackboard) = &patch.blackboard {
            for (key, value) in blackboard {
                next.blackboard.insert(key.clone(), value.clone());
                changed.push(format!("blackboard.{key}"));
            }
        }
        if let Some(state) = patch.execution_state {
            if state != next.execution_state {
                next.execution_state = state;
                changed.push("execution_state".to_string());
            }
        }
        next.bump();
        (next, changed)
    }

    /// Allocation ids past their expiry at `now`.
    pub fn expired_allocations(&self, now: DateTime<Utc>) -> Vec<AllocationId> {
        self.allocations
            .iter()
            .filter(|a| a.is_expired(now))
            .map(|a| a.allocation_id)
            .collect()
    }

    /// Check the aggregate invariants.
    pub fn validate(&self) -> ContextValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.version == 0 {
            errors.push("version must be a positive integer".to_string());
        }

        let mut allocated_sum = ResourceQuantity::ZERO;
        for allocation in &self.allocations {
            match allocated_sum.checked_add(&allocation.allocated) {
                Ok(sum) => allocated_sum = sum,
                Err(e) => errors.push(format!(
                    "allocation sum overflow at {}: {e}",
                    allocation.allocation_id
                )),
            }
        }
        match self.available.checked_add(&allocated_sum) {
            Ok(reconstructed) => {
                if reconstructed != self.total {
                    errors.push(format!(
                        "conservation violated: total {:?} != available {:?} + allocated {:?}",
                        self.total, self.available, allocated_sum
                    ));
                }
            }
            Err(e) => errors.push(format!("conservation check overflow: {e}")),
        }

        let now = Utc::now();
        for allocation in &self.allocations {
            if allocation.is_expired(now) {
                warnings.push(format!(
                    "allocation {} for {} expired at {:?} but has not been swept",
                    allocation.allocation_id, allocation.consumer_id, allocation.expires_at
                ));
            }
        }
        if self.total.is_zero() {
            warnings.push("swarm has a zero total budget".to_string());
        }

        ContextValidation {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Sort key honoring the configured grant order for batch admission.
    pub fn grant_rank(&self, request: &ResourceRequest, arrival_index: usize) -> (u8, usize) {
        match self.policy.grant_order {
            GrantOrder::Arrival => (0, arrival_index),
            // Critical first; arrival breaks ties.
            GrantOrder::Priority => {
                let weight = match request.priority {
                    AllocationPriority::Critical => 0,
                    AllocationPriority::High => 1,
                    AllocationPriority::Normal => 2,
                    AllocationPriority::Low => 3,
                };
                (weight, arrival_index)
            }
        }
    }

    fn bump(&mut self) {
        self.version += 1;
        self.last_updated = Utc::now();
    }
}

/// Result of [`SwarmContext::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Partial update applied by `update_context`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPatch {
    /// Keys merged into `configuration`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<HashMap<String, serde_json::Value>>,
    /// Keys merged into `blackboard`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blackboard: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<SwarmExecutionState>,
}

/// What changed in a committed context mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextChangeType {
    Created,
    Allocated,
    Released,
    Updated,
    Swept,
}

/// Delivered to every active subscriber after each committed mutation,
/// exactly once, in commit order per subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdateEvent {
    pub swarm_id: SwarmId,
    pub change_type: ContextChangeType,
    pub changed_paths: Vec<String>,
    pub new_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::resources::ConsumerType;

    fn request(credits: u128) -> ResourceRequest {
        ResourceRequest {
            consumer_id: "run-a".to_string(),
            consumer_type: ConsumerType::Run,
            limits: ResourceQuantity::credits_only(credits),
            purpose: "unit test".to_string(),
            priority: AllocationPriority::Normal,
        }
    }

    fn context(credits: u128) -> SwarmContext {
        SwarmContext::new(
            SwarmId::new(),
            ResourceQuantity::credits_only(credits),
            AllocationPolicy::default(),
        )
    }

    #[test]
    fn test_allocation_conserves_total() {
        let ctx = context(5000);
        let (next, allocation) = ctx.with_allocation(&request(1000), None).unwrap();
        assert_eq!(next.available.credits, 4000);
        assert_eq!(next.version, 2);
        assert_eq!(next.allocations.len(), 1);
        assert!(next.validate().is_valid);

        // Release with no reported usage: everything returns to the pool.
        let (after_release, removed, returned) = next
            .without_allocation(allocation.allocation_id, &ResourceUsage::default())
            .unwrap()
            .unwrap();
        assert_eq!(removed.allocated.credits, 1000);
        assert_eq!(returned.credits, 1000);
        assert_eq!(after_release.available.credits, 5000);
        assert_eq!(after_release.total.credits, 5000);
        assert_eq!(after_release.version, 3);
        assert!(after_release.validate().is_valid);
    }

    #[test]
    fn test_release_retires_consumed_credits_from_pool() {
        let ctx = context(5000);
        let (next, allocation) = ctx.with_allocation(&request(1000), None).unwrap();
        let usage = ResourceUsage {
            credits_used: 800,
            elapsed_ms: 0,
            memory_peak_mb: 0,
        };
        let (after, _, returned) = next
            .without_allocation(allocation.allocation_id, &usage)
            .unwrap()
            .unwrap();
        // Only the unused 200 credits flow back; 800 retire from total.
        assert_eq!(returned.credits, 200);
        assert_eq!(after.available.credits, 4200);
        assert_eq!(after.total.credits, 4200);
        assert!(after.validate().is_valid);
    }

    #[test]
    fn test_over_reported_usage_is_clamped_to_allocation() {
        let ctx = context(5000);
        let (next, allocation) = ctx.with_allocation(&request(1000), None).unwrap();
        let usage = ResourceUsage {
            credits_used: 9_999,
            elapsed_ms: 0,
            memory_peak_mb: 0,
        };
        let (after, _, returned) = next
            .without_allocation(allocation.allocation_id, &usage)
            .unwrap()
            .unwrap();
        assert_eq!(returned.credits, 0);
        assert_eq!(after.total.credits, 4000);
        assert_eq!(after.available.credits, 4000);
        assert!(after.validate().is_valid);
    }

    #[test]
    fn test_overallocation_fails_fast() {
        let ctx = context(100);
        let err = ctx.with_allocation(&request(101), None).unwrap_err();
        assert_eq!(
            err,
            ResourceError::InsufficientResource {
                resource: crate::domain::resources::ResourceKind::Credits,
                requested: 101,
                available: 100,
            }
        );
    }

    #[test]
    fn test_release_unknown_allocation_is_noop() {
        let ctx = context(100);
        assert!(ctx
            .without_allocation(AllocationId::new(), &ResourceUsage::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_patch_reports_changed_paths() {
        let ctx = context(100);
        let mut blackboard = HashMap::new();
        blackboard.insert("plan".to_string(), serde_json::json!({"steps": 3}));
        let patch = ContextPatch {
            blackboard: Some(blackboard),
            execution_state: Some(SwarmExecutionState::Active),
            ..ContextPatch::default()
        };
        let (next, changed) = ctx.with_patch(&patch);
        assert_eq!(next.version, 2);
        assert!(changed.contains(&"blackboard.plan".to_string()));
        assert!(changed.contains(&"execution_state".to_string()));
        assert_eq!(next.execution_state, SwarmExecutionState::Active);
    }

    #[test]
    fn test_validate_detects_conservation_violation() {
        let mut ctx = context(100);
        // Corrupt the ledger directly.
        ctx.available = ResourceQuantity::credits_only(40);
        let report = ctx.validate();
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("conservation"));
    }

    #[test]
    fn test_priority_grant_rank() {
        let mut ctx = context(100);
        ctx.policy.grant_order = GrantOrder::Priority;
        let mut low = request(1);
        low.priority = AllocationPriority::Low;
        let mut critical = request(1);
        critical.priority = AllocationPriority::Critical;
        assert!(ctx.grant_rank(&critical, 5) < ctx.grant_rank(&low, 0));
    }
}
