// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Ledger — Quantities, Requests, Allocations
//!
//! Pure arithmetic for the shared swarm resource pool. Everything in this
//! module is side-effect free: quantities are exact unsigned integers
//! (credits are `u128` — never floating point), every operation is checked,
//! and failures are typed so callers can report requested vs. available
//! numbers instead of a bare message.
//!
//! - [`ResourceQuantity`] — the four budget dimensions tracked per pool.
//! - [`ResourceRequest`] — what a consumer asks the pool for.
//! - [`Allocation`] — a committed reservation, owned by one consumer.
//! - [`ResourceError`] — the ledger failure taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::context::SwarmId;

/// Unique identifier for an [`Allocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId(pub Uuid);

impl AllocationId {
    /// Generate a new random `AllocationId`.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names one budget dimension for error reporting and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Credits,
    TimeBudget,
    Memory,
    ConcurrencySlots,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Credits => "credits",
            ResourceKind::TimeBudget => "time budget",
            ResourceKind::Memory => "memory",
            ResourceKind::ConcurrencySlots => "concurrency slots",
        };
        write!(f, "{}", name)
    }
}

/// An exact, non-negative bundle of the four tracked budget dimensions.
///
/// # Invariants
///
/// - Quantities are unsigned and can never go negative.
/// - All arithmetic is checked; overflow and deficit are surfaced as
///   [`ResourceError`], never wrapped or saturated silently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    /// Credit budget. Exact integer accounting, no floating point.
    pub credits: u128,
    /// Wall-clock budget in milliseconds.
    pub time_budget_ms: u64,
    /// Memory budget in mebibytes.
    pub memory_mb: u64,
    /// Concurrent execution slots.
    pub concurrency_slots: u32,
}

impl ResourceQuantity {
    /// The empty quantity.
    pub const ZERO: Self = Self {
        credits: 0,
        time_budget_ms: 0,
        memory_mb: 0,
        concurrency_slots: 0,
    };

    pub fn new(credits: u128, time_budget_ms: u64, memory_mb: u64, concurrency_slots: u32) -> Self {
        Self {
            credits,
            time_budget_ms,
            memory_mb,
            concurrency_slots,
        }
    }

    /// A quantity carrying only credits. Convenient for refunds.
    pub fn credits_only(credits: u128) -> Self {
        Self {
            credits,
            ..Self::ZERO
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Checked component-wise addition.
    pub fn checked_add(&self, other: &Self) -> Result<Self, ResourceError> {
        Ok(Self {
            credits: self
                .credits
                .checked_add(other.credits)
                .ok_or(ResourceError::Overflow {
                    resource: ResourceKind::Credits,
                })?,
            time_budget_ms: self.time_budget_ms.checked_add(other.time_budget_ms).ok_or(
                ResourceError::Overflow {
                    resource: ResourceKind::TimeBudget,
                },
            )?,
            memory_mb: self
                .memory_mb
                .checked_add(other.memory_mb)
                .ok_or(ResourceError::Overflow {
                    resource: ResourceKind::Memory,
                })?,
            concurrency_slots: self
                .concurrency_slots
                .checked_add(other.concurrency_slots)
                .ok_or(ResourceError::Overflow {
                    resource: ResourceKind::ConcurrencySlots,
                })?,
        })
    }

    /// Checked component-wise subtraction.
    ///
    /// Fails with [`ResourceError::InsufficientResource`] naming the first
    /// deficient dimension; no partial subtraction is performed.
    pub fn checked_sub(&self, other: &Self) -> Result<Self, ResourceError> {
        if let Some((resource, requested, available)) = self.first_deficit(other) {
            return Err(ResourceError::InsufficientResource {
                resource,
                requested,
                available,
            });
        }
        Ok(Self {
            credits: self.credits - other.credits,
            time_budget_ms: self.time_budget_ms - other.time_budget_ms,
            memory_mb: self.memory_mb - other.memory_mb,
            concurrency_slots: self.concurrency_slots - other.concurrency_slots,
        })
    }

    /// Whether this quantity can cover `requested` in every dimension.
    pub fn covers(&self, requested: &Self) -> bool {
        self.first_deficit(requested).is_none()
    }

    /// First dimension where `self < requested`, with the numbers involved.
    ///
    /// Dimension order is fixed (credits, time, memory, slots) so failures
    /// are deterministic for a given request.
    pub fn first_deficit(&self, requested: &Self) -> Option<(ResourceKind, u128, u128)> {
        if self.credits < requested.credits {
            return Some((ResourceKind::Credits, requested.credits, self.credits));
        }
        if self.time_budget_ms < requested.time_budget_ms {
            return Some((
                ResourceKind::TimeBudget,
                requested.time_budget_ms as u128,
                self.time_budget_ms as u128,
            ));
        }
        if self.memory_mb < requested.memory_mb {
            return Some((
                ResourceKind::Memory,
                requested.memory_mb as u128,
                self.memory_mb as u128,
            ));
        }
        if self.concurrency_slots < requested.concurrency_slots {
            return Some((
                ResourceKind::ConcurrencySlots,
                requested.concurrency_slots as u128,
                self.concurrency_slots as u128,
            ));
        }
        None
    }
}

/// The scope a consumer allocates at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerType {
    Swarm,
    Run,
    Step,
}

impl std::fmt::Display for ConsumerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsumerType::Swarm => "swarm",
            ConsumerType::Run => "run",
            ConsumerType::Step => "step",
        };
        write!(f, "{}", name)
    }
}

/// Grant ordering weight for an allocation request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// What a consumer asks the pool for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Opaque identity of the requesting consumer (run id, step id, ...).
    pub consumer_id: String,
    pub consumer_type: ConsumerType,
    /// Upper bounds requested per dimension. Granted whole or not at all.
    pub limits: ResourceQuantity,
    /// Human-readable purpose, carried into the allocation for audit.
    pub purpose: String,
    #[serde(default)]
    pub priority: AllocationPriority,
}

/// A committed reservation against a swarm pool.
///
/// Owned exclusively by the [`SwarmContext`](crate::domain::context::SwarmContext)
/// that created it; removed only by a matching release or the expiry sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_id: AllocationId,
    pub consumer_id: String,
    pub consumer_type: ConsumerType,
    pub allocated: ResourceQuantity,
    pub purpose: String,
    pub priority: AllocationPriority,
    pub allocated_at: DateTime<Utc>,
    /// Past this instant the allocation is reclaimable by the expiry sweep.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Allocation {
    /// Materialize a request into an allocation stamped `now`.
    pub fn from_request(request: &ResourceRequest, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            allocation_id: AllocationId::new(),
            consumer_id: request.consumer_id.clone(),
            consumer_type: request.consumer_type,
            allocated: request.limits,
            purpose: request.purpose.clone(),
            priority: request.priority,
            allocated_at: Utc::now(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Actual consumption reported back when a reservation is released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub credits_used: u128,
    pub elapsed_ms: u64,
    pub memory_peak_mb: u64,
}

/// Ledger failure taxonomy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResourceError {
    /// The request exceeds what the pool currently has. Not retried
    /// automatically; surfaced with the numbers so the caller can decide.
    #[error("insufficient {resource}: requested {requested}, available {available}")]
    InsufficientResource {
        resource: ResourceKind,
        requested: u128,
        available: u128,
    },

    /// Ledger arithmetic would overflow the dimension's representation.
    #[error("resource arithmetic overflow on {resource}")]
    Overflow { resource: ResourceKind },

    /// The versioned compare-and-swap lost every attempt of its bounded
    /// retry loop.
    #[error("swarm {swarm_id} context modified concurrently; gave up after {attempts} attempts")]
    ConcurrentModification { swarm_id: SwarmId, attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantity(credits: u128) -> ResourceQuantity {
        ResourceQuantity::new(credits, 60_000, 512, 4)
    }

    #[test]
    fn test_checked_sub_exact() {
        let pool = quantity(5000);
        let request = ResourceQuantity::new(1000, 10_000, 128, 1);
        let rest = pool.checked_sub(&request).unwrap();
        assert_eq!(rest.credits, 4000);
        assert_eq!(rest.time_budget_ms, 50_000);
        assert_eq!(rest.memory_mb, 384);
        assert_eq!(rest.concurrency_slots, 3);
    }

    #[test]
    fn test_checked_sub_reports_first_deficit() {
        let pool = quantity(100);
        let request = ResourceQuantity::credits_only(101);
        let err = pool.checked_sub(&request).unwrap_err();
        assert_eq!(
            err,
            ResourceError::InsufficientResource {
                resource: ResourceKind::Credits,
                requested: 101,
                available: 100,
            }
        );
    }

    #[test]
    fn test_checked_sub_deficit_in_non_credit_dimension() {
        let pool = ResourceQuantity::new(1000, 5_000, 512, 4);
        let request = ResourceQuantity::new(10, 6_000, 0, 0);
        let err = pool.checked_sub(&request).unwrap_err();
        match err {
            ResourceError::InsufficientResource { resource, .. } => {
                assert_eq!(resource, ResourceKind::TimeBudget);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_checked_add_overflow() {
        let a = ResourceQuantity::credits_only(u128::MAX);
        let b = ResourceQuantity::credits_only(1);
        let err = a.checked_add(&b).unwrap_err();
        assert_eq!(
            err,
            ResourceError::Overflow {
                resource: ResourceKind::Credits
            }
        );
    }

    #[test]
    fn test_covers() {
        let pool = quantity(5000);
        assert!(pool.covers(&ResourceQuantity::credits_only(5000)));
        assert!(!pool.covers(&ResourceQuantity::credits_only(5001)));
        assert!(pool.covers(&ResourceQuantity::ZERO));
    }

    #[test]
    fn test_allocation_expiry() {
        let request = ResourceRequest {
            consumer_id: "run-1".to_string(),
            consumer_type: ConsumerType::Run,
            limits: ResourceQuantity::credits_only(10),
            purpose: "test".to_string(),
            priority: AllocationPriority::Normal,
        };
        let now = Utc::now();
        let alive = Allocation::from_request(&request, Some(now + chrono::Duration::minutes(5)));
        let expired = Allocation::from_request(&request, Some(now - chrono::Duration::minutes(5)));
        let unbounded = Allocation::from_request(&request, None);
        assert!(!alive.is_expired(now));
        assert!(expired.is_expired(now));
        assert!(!unbounded.is_expired(now));
    }
}
