// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Run Orchestrator (Application Service)
//!
//! Drives one run's state machine: grants step budgets through the Run
//! Context Manager, delegates business logic to the injected
//! [`StepExecutor`], and routes failures through classification → strategy
//! selection → circuit breaker update → release/reallocate → transition.
//!
//! ## Failure loop
//!
//! ```text
//! loop {
//!     breaker.try_acquire()            // fail fast while open
//!     allocation = allocate_for_step()
//!     result = executor.execute(step, allocation, snapshot)
//!     release_from_step(usage)         // always reconcile the budget
//!     match result {
//!         Ok  => record, advance
//!         Err => classify -> select_strategy -> apply (retry / fallback /
//!                 reduce scope / degrade / escalate / stop / trip breaker)
//!     }
//! }
//! ```
//!
//! Cancellation releases live allocations first and commits `Cancelled`
//! under the record's own version check; racing a natural completion,
//! whichever transition commits first wins and the loser observes
//! "already terminal".

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use hive_core::domain::circuit_breaker::BreakerRegistry;
use hive_core::domain::classification::{classify, FailureContext, FailureKind, StepFailure};
use hive_core::domain::config::{EngineConfig, RetryPolicy};
use hive_core::domain::context::SwarmId;
use hive_core::domain::events::{ResourceEvent, RunLifecycleEvent};
use hive_core::domain::recovery::{select_strategy, RecoveryStrategy};
use hive_core::domain::resources::ResourceUsage;
use hive_core::domain::run::{
    CheckpointId, RunError, RunId, RunRecord, RunState, StepExecution, StepId, StepState,
};
use hive_core::infrastructure::event_bus::EventBus;
use hive_core::infrastructure::kv::{KeyValueStore, KvError, WriteCondition};

use crate::application::context_store::{ContextStoreError, SwarmContextManager};
use crate::application::run_context::{RunContextError, RunContextManager};
use crate::domain::allocation_view::{
    RunBudgetError, RunResourceRequest, StepAllocation, StepResourceRequest,
};
use crate::domain::snapshot::RunContextSnapshot;

/// Orchestrator failure taxonomy.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run {run_id} not found")]
    RunNotFound { run_id: RunId },

    #[error("run definition missing for {run_id}")]
    DefinitionNotFound { run_id: RunId },

    #[error(transparent)]
    RunContext(#[from] RunContextError),

    #[error(transparent)]
    Store(#[from] ContextStoreError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// One step of a run definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Circuit-breaker key of the collaborator this step calls.
    pub component: String,
    pub request: StepResourceRequest,
    #[serde(default = "default_step_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub input: serde_json::Value,
}

fn default_step_attempts() -> u32 {
    3
}

/// A run definition: the ordered steps the orchestrator drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub inputs: serde_json::Value,
}

/// Attempt metadata handed to the executor; the orchestrator never
/// interprets business semantics, the executor decides what a recovery
/// hint means for its domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Strategy that led to this attempt (`None` on the first).
    pub recovery: Option<RecoveryStrategy>,
}

/// Successful step result with reported resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub output: serde_json::Value,
    pub usage: ResourceUsage,
}

/// Step-execution collaborator. Receives a step budget and a run context
/// snapshot, returns a result or a typed failure; only success/failure and
/// reported usage are inspected by the orchestrator.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &StepDefinition,
        allocation: &StepAllocation,
        context: &RunContextSnapshot,
        attempt: &StepAttempt,
    ) -> Result<StepOutcome, StepFailure>;
}

fn record_key(run_id: RunId) -> String {
    format!("run:{run_id}:record")
}

fn definition_key(run_id: RunId) -> String {
    format!("run:{run_id}:definition")
}

fn history_key(run_id: RunId) -> String {
    format!("run:{run_id}:history")
}

fn checkpoints_key(run_id: RunId) -> String {
    format!("run:{run_id}:checkpoints")
}

/// How a step loop ended.
enum StepLoopEnd {
    Completed,
    Paused { reason: String },
    Failed { reason: String },
    EmergencyStopped { reason: String },
    /// Another actor drove the record terminal while we were working.
    Superseded,
}

/// Application service driving run state machines.
pub struct RunOrchestrator {
    contexts: Arc<SwarmContextManager>,
    run_contexts: Arc<RunContextManager>,
    executor: Arc<dyn StepExecutor>,
    breakers: BreakerRegistry,
    bus: Arc<EventBus>,
    kv: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
}

impl RunOrchestrator {
    pub fn new(
        contexts: Arc<SwarmContextManager>,
        run_contexts: Arc<RunContextManager>,
        executor: Arc<dyn StepExecutor>,
        bus: Arc<EventBus>,
        kv: Arc<dyn KeyValueStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            contexts,
            run_contexts,
            executor,
            breakers: BreakerRegistry::new(config.circuit_breaker.clone()),
            bus,
            kv,
            retry: config.cas_retry.clone(),
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    // ========================================================================
    // Run lifecycle
    // ========================================================================

    /// Execute a run to a terminal (or paused) state and return its record.
    pub async fn execute_run(
        &self,
        swarm_id: SwarmId,
        definition: RunDefinition,
        request: RunResourceRequest,
    ) -> Result<RunRecord, OrchestratorError> {
        let run_id = RunId::new();
        let mut record = RunRecord::new(run_id, swarm_id, definition.inputs.clone());

        self.kv
            .put(
                &definition_key(run_id),
                serde_json::to_value(&definition).map_err(KvError::from)?,
                WriteCondition::Absent,
                None,
            )
            .await?;
        self.kv
            .put(
                &record_key(run_id),
                serde_json::to_value(&record).map_err(KvError::from)?,
                WriteCondition::Absent,
                None,
            )
            .await?;

        // Budget first: a run that cannot fund itself never starts.
        if let Err(e) = self
            .run_contexts
            .allocate_from_swarm(swarm_id, run_id, request)
            .await
        {
            record.transition_to(RunState::Failed)?;
            self.try_commit(&mut record).await?;
            self.bus
                .publish_run_event(RunLifecycleEvent::RunFailed {
                    run_id,
                    swarm_id,
                    reason: e.to_string(),
                    failed_at: Utc::now(),
                })
                .await;
            return Err(e.into());
        }

        record.transition_to(RunState::Running)?;
        if !self.try_commit(&mut record).await? {
            // Nobody else knows this run yet; a conflict here is a bug.
            return Err(KvError::Backend("fresh run record conflicted".to_string()).into());
        }
        self.bus
            .publish_run_event(RunLifecycleEvent::RunStarted {
                run_id,
                swarm_id,
                started_at: Utc::now(),
            })
            .await;
        info!(run_id = %run_id, swarm_id = %swarm_id, run = %definition.name, "run started");

        self.drive(run_id, &definition, 0).await
    }

    /// Resume a paused run from its first incomplete step.
    pub async fn resume_run(&self, run_id: RunId) -> Result<RunRecord, OrchestratorError> {
        let definition = self.load_definition(run_id).await?;
        // Rehydrate the allocation table when resuming in a fresh process.
        self.run_contexts.hydrate(run_id).await?;

        let mut record = self.load_record(run_id).await?;
        record.transition_to(RunState::Running)?;
        if !self.try_commit(&mut record).await? {
            let fresh = self.load_record(run_id).await?;
            return Ok(fresh);
        }
        self.bus
            .publish_run_event(RunLifecycleEvent::RunResumed {
                run_id,
                resumed_at: Utc::now(),
            })
            .await;

        let next_step = record
            .step_executions
            .iter()
            .filter(|s| matches!(s.state, StepState::Completed | StepState::Skipped))
            .count();
        self.drive(run_id, &definition, next_step).await
    }

    /// Cancel a run: release its live allocations, then transition.
    ///
    /// Idempotent and safe to race with natural completion; whichever
    /// transition commits first wins, the loser observes "already
    /// terminal" and performs no further mutation.
    pub async fn cancel_run(
        &self,
        run_id: RunId,
        reason: Option<String>,
    ) -> Result<RunState, OrchestratorError> {
        loop {
            let mut record = self.load_record(run_id).await?;
            if record.state.is_terminal() {
                debug!(run_id = %run_id, state = %record.state, "cancel found run already terminal");
                return Ok(record.state);
            }
            let usage = record.total_usage();
            self.run_contexts
                .release_to_swarm(record.swarm_id, run_id, &usage)
                .await?;
            record.transition_to(RunState::Cancelled)?;
            if self.try_commit(&mut record).await? {
                self.bus
                    .publish_run_event(RunLifecycleEvent::RunCancelled {
                        run_id,
                        swarm_id: record.swarm_id,
                        reason: reason.clone(),
                        cancelled_at: Utc::now(),
                    })
                    .await;
                info!(run_id = %run_id, "run cancelled");
                return Ok(RunState::Cancelled);
            }
            // Lost the race; re-read and decide again.
        }
    }

    /// Pause a running run at the next step boundary.
    pub async fn pause_run(
        &self,
        run_id: RunId,
        reason: Option<String>,
    ) -> Result<(), OrchestratorError> {
        loop {
            let mut record = self.load_record(run_id).await?;
            record.transition_to(RunState::Paused)?;
            if self.try_commit(&mut record).await? {
                self.bus
                    .publish_run_event(RunLifecycleEvent::RunPaused {
                        run_id,
                        reason: reason.clone(),
                        paused_at: Utc::now(),
                    })
                    .await;
                return Ok(());
            }
        }
    }

    /// Snapshot the run into a new immutable checkpoint.
    pub async fn checkpoint_run(&self, run_id: RunId) -> Result<CheckpointId, OrchestratorError> {
        loop {
            let mut record = self.load_record(run_id).await?;
            let checkpoint = record.take_checkpoint();
            if self.try_commit(&mut record).await? {
                // Ordered checkpoint index; failures logged, the checkpoint
                // itself is already committed inside the record.
                if let Err(e) = self
                    .kv
                    .list_append(
                        &checkpoints_key(run_id),
                        json!({
                            "checkpoint_id": checkpoint.checkpoint_id,
                            "taken_at": checkpoint.taken_at,
                        }),
                    )
                    .await
                {
                    warn!(run_id = %run_id, error = %e, "failed to index checkpoint");
                }
                self.bus
                    .publish_run_event(RunLifecycleEvent::CheckpointTaken {
                        run_id,
                        checkpoint_id: checkpoint.checkpoint_id,
                        taken_at: checkpoint.taken_at,
                    })
                    .await;
                return Ok(checkpoint.checkpoint_id);
            }
        }
    }

    /// Rewind the run to a checkpoint; the restored run lands in `Paused`.
    pub async fn restore_run(
        &self,
        run_id: RunId,
        checkpoint_id: CheckpointId,
    ) -> Result<(), OrchestratorError> {
        loop {
            let mut record = self.load_record(run_id).await?;
            record.restore_checkpoint(checkpoint_id)?;
            if self.try_commit(&mut record).await? {
                info!(run_id = %run_id, checkpoint_id = %checkpoint_id, "run restored from checkpoint");
                return Ok(());
            }
        }
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<RunRecord, OrchestratorError> {
        self.load_record(run_id).await
    }

    /// Committed state transition history, oldest first.
    pub async fn run_history(
        &self,
        run_id: RunId,
    ) -> Result<Vec<serde_json::Value>, OrchestratorError> {
        Ok(self.kv.list_range(&history_key(run_id), 0, None).await?)
    }

    // ========================================================================
    // Step driving
    // ========================================================================

    async fn drive(
        &self,
        run_id: RunId,
        definition: &RunDefinition,
        start_index: usize,
    ) -> Result<RunRecord, OrchestratorError> {
        let mut snapshot = self.run_contexts.get_run_context(run_id).await?;

        for step in definition.steps.iter().skip(start_index) {
            let end = self.drive_step(run_id, step, &mut snapshot).await?;
            match end {
                StepLoopEnd::Completed => continue,
                StepLoopEnd::Superseded => {
                    return self.load_record(run_id).await;
                }
                StepLoopEnd::Paused { reason } => {
                    self.commit_pause(run_id, reason).await?;
                    return self.load_record(run_id).await;
                }
                StepLoopEnd::Failed { reason } => {
                    self.commit_failure(run_id, reason).await?;
                    return self.load_record(run_id).await;
                }
                StepLoopEnd::EmergencyStopped { reason } => {
                    let state = self.cancel_run(run_id, Some(reason)).await?;
                    debug!(run_id = %run_id, state = %state, "run emergency-stopped");
                    return self.load_record(run_id).await;
                }
            }
        }

        self.finalize(run_id, &snapshot).await?;
        self.load_record(run_id).await
    }

    /// Execute one step to completion, degradation, or a terminal decision.
    async fn drive_step(
        &self,
        run_id: RunId,
        step: &StepDefinition,
        snapshot: &mut RunContextSnapshot,
    ) -> Result<StepLoopEnd, OrchestratorError> {
        let step_id = StepId::new();
        let started_at = Utc::now();
        let mut attempt = 0u32;
        let mut exhausted: Vec<RecoveryStrategy> = Vec::new();
        let mut recovery: Option<RecoveryStrategy> = None;
        let mut request = step.request.clone();
        // Safety net above the per-strategy bounds; classification already
        // turns exhausted retries into escalation well before this.
        let attempt_ceiling = step.max_attempts.saturating_mul(2).max(4);

        loop {
            // Observe external transitions between attempts.
            let fresh = self.load_record(run_id).await?;
            if fresh.state.is_terminal() {
                return Ok(StepLoopEnd::Superseded);
            }
            if fresh.state == RunState::Paused {
                return Ok(StepLoopEnd::Superseded);
            }

            attempt += 1;
            if attempt > attempt_ceiling {
                return Ok(StepLoopEnd::Failed {
                    reason: format!(
                        "step '{}' exceeded the attempt ceiling ({attempt_ceiling})",
                        step.name
                    ),
                });
            }

            // Circuit breaker admission.
            let breaker = self.breakers.breaker(&step.component);
            let admission = breaker.lock().try_acquire();
            if let Err(open) = admission {
                let failure = StepFailure::new(open.to_string());
                let end = self
                    .handle_failure(
                        run_id, step, step_id, &failure, attempt, &mut exhausted,
                        &mut recovery, &mut request, started_at,
                    )
                    .await?;
                match end {
                    Some(end) => return Ok(end),
                    None => continue,
                }
            }

            // Step budget reservation.
            let allocation = match self.run_contexts.allocate_for_step(run_id, step_id, &request) {
                Ok(allocation) => allocation,
                Err(RunContextError::Budget(RunBudgetError::InsufficientRunBudget {
                    resource,
                    requested,
                    remaining,
                    ..
                })) => {
                    let swarm_id = self
                        .run_contexts
                        .run_allocation(run_id)
                        .map(|a| a.swarm_id);
                    if let Some(swarm_id) = swarm_id {
                        self.bus
                            .publish_resource_event(ResourceEvent::ResourceExhausted {
                                swarm_id,
                                resource,
                                requested,
                                available: remaining,
                                observed_at: Utc::now(),
                            })
                            .await;
                    }
                    let failure = StepFailure::new(format!(
                        "insufficient run budget for {resource}: requested {requested}, remaining {remaining}"
                    ))
                    .with_kind(FailureKind::BudgetExceeded);
                    let end = self
                        .handle_failure(
                            run_id, step, step_id, &failure, attempt, &mut exhausted,
                            &mut recovery, &mut request, started_at,
                        )
                        .await?;
                    match end {
                        Some(end) => return Ok(end),
                        None => continue,
                    }
                }
                Err(RunContextError::Budget(RunBudgetError::UnknownRun { .. })) => {
                    // A concurrent cancel released the run out from under
                    // us between attempts.
                    debug!(run_id = %run_id, "run allocation gone; yielding to the terminal transition");
                    return Ok(StepLoopEnd::Superseded);
                }
                Err(e) => return Err(e.into()),
            };

            // Delegate business logic to the collaborator.
            let attempt_meta = StepAttempt { attempt, recovery };
            let result = self
                .executor
                .execute(step, &allocation, snapshot, &attempt_meta)
                .await;

            match result {
                Ok(outcome) => {
                    breaker.lock().record_success();
                    match self
                        .run_contexts
                        .release_from_step(run_id, &allocation, &outcome.usage)
                    {
                        Ok(_) => {}
                        Err(RunContextError::Budget(RunBudgetError::UnknownRun { .. })) => {
                            return Ok(StepLoopEnd::Superseded);
                        }
                        Err(e) => return Err(e.into()),
                    }

                    snapshot
                        .variables
                        .insert(step.name.clone(), outcome.output.clone());
                    snapshot.completed_steps += 1;
                    snapshot.credits_used =
                        snapshot.credits_used.saturating_add(outcome.usage.credits_used);
                    snapshot.current_location = Some(step.name.clone());
                    snapshot.updated_at = Utc::now();
                    self.run_contexts
                        .update_run_context(run_id, snapshot)
                        .await?;

                    let execution = StepExecution {
                        step_id,
                        name: step.name.clone(),
                        state: StepState::Completed,
                        attempts: attempt,
                        allocation_id: self
                            .run_contexts
                            .run_allocation(run_id)
                            .map(|a| a.allocation_id),
                        usage: Some(outcome.usage),
                        error: None,
                        started_at,
                        ended_at: Some(Utc::now()),
                    };
                    if !self.commit_step(run_id, execution, &step.name).await? {
                        return Ok(StepLoopEnd::Superseded);
                    }
                    debug!(run_id = %run_id, step = %step.name, attempts = attempt, "step completed");
                    return Ok(StepLoopEnd::Completed);
                }
                Err(failure) => {
                    breaker.lock().record_failure();
                    // Budget reconciliation happens on failure too; credits
                    // the attempt burned stay burned.
                    match self
                        .run_contexts
                        .release_from_step(run_id, &allocation, &failure.usage)
                    {
                        Ok(_) => {}
                        Err(RunContextError::Budget(RunBudgetError::UnknownRun { .. })) => {
                            return Ok(StepLoopEnd::Superseded);
                        }
                        Err(e) => return Err(e.into()),
                    }
                    snapshot.credits_used =
                        snapshot.credits_used.saturating_add(failure.usage.credits_used);

                    let end = self
                        .handle_failure(
                            run_id, step, step_id, &failure, attempt, &mut exhausted,
                            &mut recovery, &mut request, started_at,
                        )
                        .await?;
                    match end {
                        Some(end) => return Ok(end),
                        None => continue,
                    }
                }
            }
        }
    }

    /// Classify the failure, pick a strategy, apply its local effects.
    ///
    /// Returns `Some(end)` when the step loop must stop, `None` to try
    /// again.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        run_id: RunId,
        step: &StepDefinition,
        step_id: StepId,
        failure: &StepFailure,
        attempt: u32,
        exhausted: &mut Vec<RecoveryStrategy>,
        recovery: &mut Option<RecoveryStrategy>,
        request: &mut StepResourceRequest,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<Option<StepLoopEnd>, OrchestratorError> {
        let allocation = self.run_contexts.run_allocation(run_id);
        let ctx = FailureContext {
            component: step.component.clone(),
            attempt,
            max_attempts: step.max_attempts,
            budget_exhausted: allocation
                .as_ref()
                .map(|a| a.credits_exhausted())
                .unwrap_or(true),
            remaining_credits: allocation.map(|a| a.remaining.credits).unwrap_or(0),
        };
        let classification = classify(failure, &ctx);
        let breaker = self.breakers.breaker(&step.component);
        let breaker_state = breaker.lock().state();
        let strategy = select_strategy(&classification, exhausted, Some(breaker_state));

        warn!(
            run_id = %run_id,
            step = %step.name,
            attempt,
            category = ?classification.category,
            recoverability = ?classification.recoverability,
            %strategy,
            error = %failure.message,
            "step attempt failed"
        );

        match strategy {
            RecoveryStrategy::RetrySame => {
                *recovery = Some(strategy);
                Ok(None)
            }
            RecoveryStrategy::WaitAndRetry => {
                *recovery = Some(strategy);
                let delay = self.retry.delay_before(attempt + 1);
                tokio::time::sleep(delay).await;
                Ok(None)
            }
            RecoveryStrategy::RetryModified
            | RecoveryStrategy::FallbackStrategy
            | RecoveryStrategy::FallbackModel => {
                // One-shot alternatives: spend them and pass the hint down.
                exhausted.push(strategy);
                *recovery = Some(strategy);
                Ok(None)
            }
            RecoveryStrategy::ReduceScope => {
                exhausted.push(strategy);
                *recovery = Some(strategy);
                request.credits = (request.credits / 2).max(1);
                request.memory_mb = (request.memory_mb / 2).max(1);
                debug!(
                    run_id = %run_id,
                    step = %step.name,
                    credits = %request.credits,
                    "step scope reduced"
                );
                Ok(None)
            }
            RecoveryStrategy::GracefulDegradation => {
                let execution = StepExecution {
                    step_id,
                    name: step.name.clone(),
                    state: StepState::Skipped,
                    attempts: attempt,
                    allocation_id: self
                        .run_contexts
                        .run_allocation(run_id)
                        .map(|a| a.allocation_id),
                    usage: Some(failure.usage),
                    error: Some(failure.message.clone()),
                    started_at,
                    ended_at: Some(Utc::now()),
                };
                if !self.commit_step(run_id, execution, &step.name).await? {
                    return Ok(Some(StepLoopEnd::Superseded));
                }
                info!(run_id = %run_id, step = %step.name, "step degraded out of the run");
                Ok(Some(StepLoopEnd::Completed))
            }
            RecoveryStrategy::EscalateToParent => Ok(Some(StepLoopEnd::Failed {
                reason: format!(
                    "step '{}' escalated to parent after {attempt} attempts: {}",
                    step.name, failure.message
                ),
            })),
            RecoveryStrategy::EscalateToHuman => Ok(Some(StepLoopEnd::Paused {
                reason: format!(
                    "step '{}' awaiting human intervention: {}",
                    step.name, failure.message
                ),
            })),
            RecoveryStrategy::EmergencyStop => Ok(Some(StepLoopEnd::EmergencyStopped {
                reason: format!("emergency stop in step '{}': {}", step.name, failure.message),
            })),
            RecoveryStrategy::CircuitBreak => {
                breaker.lock().trip();
                exhausted.push(strategy);
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Record commits
    // ========================================================================

    async fn load_record(&self, run_id: RunId) -> Result<RunRecord, OrchestratorError> {
        let Some(stored) = self.kv.get(&record_key(run_id)).await? else {
            return Err(OrchestratorError::RunNotFound { run_id });
        };
        Ok(serde_json::from_value(stored.value).map_err(KvError::from)?)
    }

    async fn load_definition(&self, run_id: RunId) -> Result<RunDefinition, OrchestratorError> {
        let Some(stored) = self.kv.get(&definition_key(run_id)).await? else {
            return Err(OrchestratorError::DefinitionNotFound { run_id });
        };
        Ok(serde_json::from_value(stored.value).map_err(KvError::from)?)
    }

    /// Commit the record under its version check. Returns false when the
    /// commit lost to a concurrent transition; the caller reloads and
    /// decides.
    async fn try_commit(&self, record: &mut RunRecord) -> Result<bool, OrchestratorError> {
        let expected = record.version;
        record.version += 1;
        let value = serde_json::to_value(&*record).map_err(KvError::from)?;
        match self
            .kv
            .put(
                &record_key(record.run_id),
                value,
                WriteCondition::VersionEquals(expected),
                None,
            )
            .await
        {
            Ok(_) => {
                if let Err(e) = self
                    .kv
                    .list_append(
                        &history_key(record.run_id),
                        json!({
                            "state": record.state,
                            "version": record.version,
                            "at": record.updated_at,
                        }),
                    )
                    .await
                {
                    warn!(run_id = %record.run_id, error = %e, "failed to append run history");
                }
                Ok(true)
            }
            Err(KvError::VersionConflict { .. }) => {
                record.version = expected;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a finished step and the new cursor. Returns false when the
    /// run went terminal/paused underneath us.
    async fn commit_step(
        &self,
        run_id: RunId,
        execution: StepExecution,
        location: &str,
    ) -> Result<bool, OrchestratorError> {
        loop {
            let mut record = self.load_record(run_id).await?;
            if record.state.is_terminal() || record.state == RunState::Paused {
                return Ok(false);
            }
            record.step_executions.push(execution.clone());
            record.advance_to(location);
            if self.try_commit(&mut record).await? {
                return Ok(true);
            }
        }
    }

    async fn commit_pause(&self, run_id: RunId, reason: String) -> Result<(), OrchestratorError> {
        loop {
            let mut record = self.load_record(run_id).await?;
            if record.state.is_terminal() || record.state == RunState::Paused {
                return Ok(());
            }
            record.transition_to(RunState::Paused)?;
            if self.try_commit(&mut record).await? {
                self.bus
                    .publish_run_event(RunLifecycleEvent::RunPaused {
                        run_id,
                        reason: Some(reason),
                        paused_at: Utc::now(),
                    })
                    .await;
                return Ok(());
            }
        }
    }

    async fn commit_failure(&self, run_id: RunId, reason: String) -> Result<(), OrchestratorError> {
        loop {
            let mut record = self.load_record(run_id).await?;
            if record.state.is_terminal() {
                return Ok(());
            }
            let swarm_id = record.swarm_id;
            let usage = record.total_usage();
            // Release before the terminal transition; a second release
            // attempt after a retry is a safe no-op.
            self.run_contexts
                .release_to_swarm(swarm_id, run_id, &usage)
                .await?;
            record.transition_to(RunState::Failed)?;
            if self.try_commit(&mut record).await? {
                self.bus
                    .publish_run_event(RunLifecycleEvent::RunFailed {
                        run_id,
                        swarm_id,
                        reason,
                        failed_at: Utc::now(),
                    })
                    .await;
                info!(run_id = %run_id, "run failed");
                return Ok(());
            }
        }
    }

    /// Complete the run: release its budget and commit `Completed` under
    /// the finalize lock, so exactly one process finalizes.
    async fn finalize(
        &self,
        run_id: RunId,
        snapshot: &RunContextSnapshot,
    ) -> Result<(), OrchestratorError> {
        let record = self.load_record(run_id).await?;
        let swarm_id = record.swarm_id;

        let lock = self
            .contexts
            .try_acquire_lock(swarm_id, &format!("run-finalize:{run_id}"))
            .await?;
        let Some(lock) = lock else {
            debug!(run_id = %run_id, "another process holds the finalize lock");
            return Ok(());
        };

        let result = self.finalize_locked(run_id, swarm_id, snapshot).await;
        if let Err(e) = lock.release().await {
            warn!(run_id = %run_id, error = %e, "failed to release finalize lock");
        }
        result
    }

    async fn finalize_locked(
        &self,
        run_id: RunId,
        swarm_id: SwarmId,
        snapshot: &RunContextSnapshot,
    ) -> Result<(), OrchestratorError> {
        loop {
            let mut record = self.load_record(run_id).await?;
            if record.state.is_terminal() {
                // Lost the race (e.g. cancelled); nothing further to do.
                return Ok(());
            }
            let usage = record.total_usage();
            self.run_contexts
                .release_to_swarm(swarm_id, run_id, &usage)
                .await?;
            record.context.outputs = serde_json::to_value(&snapshot.variables)
                .unwrap_or(serde_json::Value::Null);
            if let Some(main) = record.branches.iter_mut().find(|b| b.name == "main") {
                main.completed = true;
            }
            record.transition_to(RunState::Completed)?;
            let total_steps = record.step_executions.len() as u32;
            if self.try_commit(&mut record).await? {
                self.bus
                    .publish_run_event(RunLifecycleEvent::RunCompleted {
                        run_id,
                        swarm_id,
                        total_steps,
                        usage,
                        completed_at: Utc::now(),
                    })
                    .await;
                info!(run_id = %run_id, total_steps, "run completed");
                return Ok(());
            }
        }
    }
}
