// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Run and Step Allocation Views
//!
//! Local views over one swarm-level [`Allocation`]: the Run Context
//! Manager holds a [`RunAllocation`] mirroring the committed grant plus a
//! `remaining` budget that step reservations decrement in-process, so only
//! the run-to-swarm and step-to-run boundaries touch the context store.
//!
//! A view is owned by exactly one process for the allocation's lifetime;
//! no cross-process locking is involved at this level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hive_core::domain::context::SwarmId;
use hive_core::domain::resources::{
    Allocation, AllocationId, AllocationPriority, ConsumerType, ResourceKind, ResourceQuantity,
    ResourceRequest, ResourceUsage,
};
use hive_core::domain::run::{RunId, StepId};

/// What a run asks the swarm pool for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResourceRequest {
    pub credits: u128,
    /// Requested wall-clock budget; also drives the durable mirror TTL.
    pub duration_ms: u64,
    pub memory_mb: u64,
    pub concurrency_slots: u32,
    pub purpose: String,
    #[serde(default)]
    pub priority: AllocationPriority,
}

impl RunResourceRequest {
    pub fn limits(&self) -> ResourceQuantity {
        ResourceQuantity::new(
            self.credits,
            self.duration_ms,
            self.memory_mb,
            self.concurrency_slots,
        )
    }

    pub fn to_resource_request(&self, run_id: RunId) -> ResourceRequest {
        ResourceRequest {
            consumer_id: run_id.to_string(),
            consumer_type: ConsumerType::Run,
            limits: self.limits(),
            purpose: self.purpose.clone(),
            priority: self.priority,
        }
    }
}

/// What a step reserves out of its run's remaining budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResourceRequest {
    pub credits: u128,
    pub duration_ms: u64,
    pub memory_mb: u64,
    pub concurrency_slots: u32,
    pub purpose: String,
}

impl StepResourceRequest {
    pub fn reserved(&self) -> ResourceQuantity {
        ResourceQuantity::new(
            self.credits,
            self.duration_ms,
            self.memory_mb,
            self.concurrency_slots,
        )
    }
}

/// In-process mirror of a run's swarm allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAllocation {
    pub run_id: RunId,
    pub swarm_id: SwarmId,
    pub allocation_id: AllocationId,
    pub allocated: ResourceQuantity,
    /// Decremented by step reservations; refunded on step release.
    pub remaining: ResourceQuantity,
    pub allocated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RunAllocation {
    pub fn from_allocation(run_id: RunId, swarm_id: SwarmId, allocation: &Allocation) -> Self {
        Self {
            run_id,
            swarm_id,
            allocation_id: allocation.allocation_id,
            allocated: allocation.allocated,
            remaining: allocation.allocated,
            allocated_at: allocation.allocated_at,
            expires_at: allocation.expires_at,
        }
    }

    /// Reserve a step's budget out of `remaining`.
    ///
    /// The reservation is checked whole-or-nothing against every dimension
    /// before anything is decremented.
    pub fn reserve_for_step(
        &mut self,
        step_id: StepId,
        request: &StepResourceRequest,
    ) -> Result<StepAllocation, RunBudgetError> {
        let reserved = request.reserved();
        if let Some((resource, requested, remaining)) = self.remaining.first_deficit(&reserved) {
            return Err(RunBudgetError::InsufficientRunBudget {
                run_id: self.run_id,
                resource,
                requested,
                remaining,
            });
        }
        // Deficit check above guarantees this cannot fail.
        self.remaining = self
            .remaining
            .checked_sub(&reserved)
            .expect("reservation fits after deficit check");
        Ok(StepAllocation {
            step_id,
            run_id: self.run_id,
            reserved,
            reserved_at: Utc::now(),
        })
    }

    /// Return a step's unused budget after it reports actual usage.
    ///
    /// Unused credits flow back; reserved memory and concurrency slots are
    /// returned in full (they were held, not consumed). Elapsed time is
    /// never returned — time passes whether or not work got done.
    pub fn release_step(&mut self, step: &StepAllocation, usage: &ResourceUsage) -> u128 {
        let refund = step.reserved.credits.saturating_sub(usage.credits_used);
        self.remaining.credits = self.remaining.credits.saturating_add(refund);
        self.remaining.memory_mb = self
            .remaining
            .memory_mb
            .saturating_add(step.reserved.memory_mb);
        self.remaining.concurrency_slots = self
            .remaining
            .concurrency_slots
            .saturating_add(step.reserved.concurrency_slots);
        refund
    }

    /// The run's credit budget is fully spent.
    pub fn credits_exhausted(&self) -> bool {
        self.remaining.credits == 0
    }
}

/// One step's committed reservation against its run budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAllocation {
    pub step_id: StepId,
    pub run_id: RunId,
    pub reserved: ResourceQuantity,
    pub reserved_at: DateTime<Utc>,
}

/// Run-budget failure taxonomy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunBudgetError {
    /// The step request exceeds what the run has left. Carries the numbers;
    /// surfaced to the caller, never silently shrunk.
    #[error(
        "run {run_id} budget exhausted for {resource}: requested {requested}, remaining {remaining}"
    )]
    InsufficientRunBudget {
        run_id: RunId,
        resource: ResourceKind,
        requested: u128,
        remaining: u128,
    },

    /// No live allocation for this run in the manager's table.
    #[error("run {run_id} has no registered allocation")]
    UnknownRun { run_id: RunId },
}
