// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Run Context Manager (Application Service)
//!
//! Sub-allocates run budgets from the swarm pool and step budgets from the
//! run, so per-step reservations never round-trip to the context store —
//! only the run-to-swarm and step-to-run boundaries touch shared state.
//!
//! The manager owns an explicit in-process allocation table keyed by run
//! id, injected at construction rather than held as ambient singleton
//! state, so multiple managers in one process (e.g. in tests) never
//! interfere. Durable mirrors of each run allocation and context snapshot
//! live in the key-value store under a TTL clamped to configured bounds.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use hive_core::domain::config::{EngineConfig, TtlBounds};
use hive_core::domain::context::SwarmId;
use hive_core::domain::resources::ResourceUsage;
use hive_core::domain::run::{RunId, StepId};
use hive_core::infrastructure::kv::{KeyValueStore, KvError, WriteCondition};

use crate::application::context_store::{ContextStoreError, SwarmContextManager};
use crate::domain::allocation_view::{
    RunAllocation, RunBudgetError, RunResourceRequest, StepAllocation, StepResourceRequest,
};
use crate::domain::snapshot::RunContextSnapshot;

/// Run context failure taxonomy.
#[derive(Debug, Error)]
pub enum RunContextError {
    /// A run must always have been created before being queried.
    #[error("run context not found for run {run_id}")]
    RunContextNotFound { run_id: RunId },

    #[error(transparent)]
    Budget(#[from] RunBudgetError),

    #[error(transparent)]
    Store(#[from] ContextStoreError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

fn mirror_key(run_id: RunId) -> String {
    format!("run:{run_id}:allocation")
}

fn snapshot_key(run_id: RunId) -> String {
    format!("run:{run_id}:context")
}

fn swarm_runs_key(swarm_id: SwarmId) -> String {
    format!("swarm:{swarm_id}:runs")
}

/// Application service tracking run budgets between the swarm pool and the
/// steps consuming it.
pub struct RunContextManager {
    contexts: Arc<SwarmContextManager>,
    kv: Arc<dyn KeyValueStore>,
    /// Allocator-owned table of live run allocations for this process.
    runs: Arc<DashMap<RunId, RunAllocation>>,
    ttl_bounds: TtlBounds,
}

impl RunContextManager {
    pub fn new(
        contexts: Arc<SwarmContextManager>,
        kv: Arc<dyn KeyValueStore>,
        config: &EngineConfig,
    ) -> Self {
        Self::with_table(contexts, kv, config, Arc::new(DashMap::new()))
    }

    /// Construct with an externally owned allocation table.
    pub fn with_table(
        contexts: Arc<SwarmContextManager>,
        kv: Arc<dyn KeyValueStore>,
        config: &EngineConfig,
        runs: Arc<DashMap<RunId, RunAllocation>>,
    ) -> Self {
        Self {
            contexts,
            kv,
            runs,
            ttl_bounds: config.run_mirror_ttl.clone(),
        }
    }

    /// TTL for durable run state, derived from the requested duration and
    /// clamped to the configured bounds.
    fn mirror_ttl(&self, duration_ms: u64) -> Duration {
        self.ttl_bounds.clamp(Duration::from_millis(duration_ms))
    }

    // ========================================================================
    // Run <-> swarm boundary
    // ========================================================================

    /// Allocate a run's budget from the swarm pool and start tracking it.
    pub async fn allocate_from_swarm(
        &self,
        swarm_id: SwarmId,
        run_id: RunId,
        request: RunResourceRequest,
    ) -> Result<RunAllocation, RunContextError> {
        let allocation = self
            .contexts
            .allocate_resources(swarm_id, request.to_resource_request(run_id))
            .await?;
        let run_allocation = RunAllocation::from_allocation(run_id, swarm_id, &allocation);

        let ttl = self.mirror_ttl(request.duration_ms);
        let mirror = serde_json::to_value(&run_allocation).map_err(KvError::from)?;
        self.kv
            .put(&mirror_key(run_id), mirror, WriteCondition::Any, Some(ttl))
            .await?;
        self.kv
            .set_add(&swarm_runs_key(swarm_id), &run_id.to_string())
            .await?;

        let snapshot = RunContextSnapshot::new(run_id);
        self.kv
            .put(
                &snapshot_key(run_id),
                serde_json::to_value(&snapshot).map_err(KvError::from)?,
                WriteCondition::Any,
                Some(ttl),
            )
            .await?;

        self.runs.insert(run_id, run_allocation.clone());
        metrics::gauge!("hive_live_run_allocations").increment(1.0);
        info!(
            run_id = %run_id,
            swarm_id = %swarm_id,
            credits = %run_allocation.allocated.credits,
            ttl_secs = ttl.as_secs(),
            "run allocation registered"
        );
        Ok(run_allocation)
    }

    /// Release the run's swarm allocation and drop all tracking.
    ///
    /// Safe to call more than once: a second call finds no allocation and
    /// is a no-op, so retries after partial failures cannot double-release.
    /// Cleanup failures after the committed release are logged, never
    /// propagated — a dangling lookup key is less harmful than
    /// double-accounting the pool.
    pub async fn release_to_swarm(
        &self,
        swarm_id: SwarmId,
        run_id: RunId,
        usage: &ResourceUsage,
    ) -> Result<(), RunContextError> {
        let allocation_id = match self.runs.remove(&run_id) {
            Some((_, run_allocation)) => Some(run_allocation.allocation_id),
            None => {
                // Not tracked in this process; fall back to the durable
                // mirror so release still works after a restart.
                match self.kv.get(&mirror_key(run_id)).await? {
                    Some(stored) => {
                        let mirrored: RunAllocation =
                            serde_json::from_value(stored.value).map_err(KvError::from)?;
                        Some(mirrored.allocation_id)
                    }
                    None => None,
                }
            }
        };

        let Some(allocation_id) = allocation_id else {
            debug!(run_id = %run_id, "release_to_swarm found nothing to release");
            return Ok(());
        };

        self.contexts
            .release_resources(swarm_id, allocation_id, Some(*usage))
            .await?;
        metrics::gauge!("hive_live_run_allocations").decrement(1.0);
        info!(
            run_id = %run_id,
            swarm_id = %swarm_id,
            credits_used = %usage.credits_used,
            "run allocation released to swarm"
        );

        // Cleanup after the committed release: log-and-continue.
        if let Err(e) = self.kv.delete(&mirror_key(run_id)).await {
            warn!(run_id = %run_id, error = %e, "failed to delete run allocation mirror");
        }
        if let Err(e) = self.kv.delete(&snapshot_key(run_id)).await {
            warn!(run_id = %run_id, error = %e, "failed to delete run context snapshot");
        }
        if let Err(e) = self
            .kv
            .set_remove(&swarm_runs_key(swarm_id), &run_id.to_string())
            .await
        {
            warn!(run_id = %run_id, error = %e, "failed to unindex run");
        }
        Ok(())
    }

    // ========================================================================
    // Step <-> run boundary
    // ========================================================================

    /// Reserve a step budget out of the run's remaining budget.
    ///
    /// A reservation, not a measurement: actual usage is reconciled on
    /// [`release_from_step`](Self::release_from_step).
    pub fn allocate_for_step(
        &self,
        run_id: RunId,
        step_id: StepId,
        request: &StepResourceRequest,
    ) -> Result<StepAllocation, RunContextError> {
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(RunBudgetError::UnknownRun { run_id })?;
        let step = entry.reserve_for_step(step_id, request)?;
        debug!(
            run_id = %run_id,
            step_id = %step_id,
            credits = %step.reserved.credits,
            remaining = %entry.remaining.credits,
            "step budget reserved"
        );
        Ok(step)
    }

    /// Reconcile a finished step: unused credits return to the run budget,
    /// elapsed time never does.
    pub fn release_from_step(
        &self,
        run_id: RunId,
        step: &StepAllocation,
        usage: &ResourceUsage,
    ) -> Result<u128, RunContextError> {
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(RunBudgetError::UnknownRun { run_id })?;
        let refund = entry.release_step(step, usage);
        debug!(
            run_id = %run_id,
            step_id = %step.step_id,
            refund = %refund,
            remaining = %entry.remaining.credits,
            "step budget reconciled"
        );
        Ok(refund)
    }

    /// Current in-process view of the run's allocation.
    pub fn run_allocation(&self, run_id: RunId) -> Option<RunAllocation> {
        self.runs.get(&run_id).map(|a| a.clone())
    }

    /// Load the durable mirror into the in-process table, e.g. when a run
    /// is resumed by a process that did not allocate it.
    pub async fn hydrate(&self, run_id: RunId) -> Result<RunAllocation, RunContextError> {
        if let Some(existing) = self.run_allocation(run_id) {
            return Ok(existing);
        }
        let Some(stored) = self.kv.get(&mirror_key(run_id)).await? else {
            return Err(RunContextError::RunContextNotFound { run_id });
        };
        let mirrored: RunAllocation =
            serde_json::from_value(stored.value).map_err(KvError::from)?;
        info!(run_id = %run_id, "run allocation rehydrated from durable mirror");
        self.runs.insert(run_id, mirrored.clone());
        Ok(mirrored)
    }

    // ========================================================================
    // Durable run context snapshot
    // ========================================================================

    /// Persist the run's context snapshot, refreshing its TTL from the
    /// allocation's expiry.
    pub async fn update_run_context(
        &self,
        run_id: RunId,
        snapshot: &RunContextSnapshot,
    ) -> Result<(), RunContextError> {
        let ttl = self
            .runs
            .get(&run_id)
            .and_then(|a| a.expires_at)
            .map(|at| {
                let remaining = (at - Utc::now()).num_milliseconds().max(0) as u64;
                self.mirror_ttl(remaining)
            })
            .unwrap_or(self.ttl_bounds.min);
        self.kv
            .put(
                &snapshot_key(run_id),
                serde_json::to_value(snapshot).map_err(KvError::from)?,
                WriteCondition::Any,
                Some(ttl),
            )
            .await?;
        Ok(())
    }

    /// Read the run's context snapshot. A missing snapshot is a hard
    /// error: a run must have been created before being queried.
    pub async fn get_run_context(
        &self,
        run_id: RunId,
    ) -> Result<RunContextSnapshot, RunContextError> {
        let Some(stored) = self.kv.get(&snapshot_key(run_id)).await? else {
            return Err(RunContextError::RunContextNotFound { run_id });
        };
        Ok(serde_json::from_value(stored.value).map_err(KvError::from)?)
    }

    /// Runs currently indexed for a swarm.
    pub async fn runs_for_swarm(&self, swarm_id: SwarmId) -> Result<Vec<String>, RunContextError> {
        Ok(self.kv.set_members(&swarm_runs_key(swarm_id)).await?)
    }
}
