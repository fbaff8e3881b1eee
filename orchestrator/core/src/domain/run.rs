// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Run Aggregate
//!
//! A **run** is one execution of a routine on behalf of a swarm, owning a
//! sequence of steps. [`RunRecord`] is the durable state machine record the
//! orchestrator drives; it carries its own `version` so concurrent
//! transitions (cancel racing natural completion) are decided by whichever
//! commit lands first.
//!
//! Checkpoints are immutable snapshots of the record at a point in time;
//! restoring rewinds the record to one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::context::SwarmId;
use crate::domain::resources::{AllocationId, ResourceUsage};

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one step execution within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub Uuid);

impl CheckpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    /// Legal transition table.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Outcome state of one step attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Running,
    Completed,
    Failed,
    /// Degraded out of the run without completing (graceful degradation).
    Skipped,
}

/// Record of one step's execution within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: StepId,
    pub name: String,
    pub state: StepState,
    pub attempts: u32,
    pub allocation_id: Option<AllocationId>,
    pub usage: Option<ResourceUsage>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A named line of progress through the run. The orchestrator advances
/// `main`; additional branches belong to fan-out done by the step executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub current_location: Option<String>,
    pub completed: bool,
}

impl Branch {
    pub fn main() -> Self {
        Self {
            name: "main".to_string(),
            current_location: None,
            completed: false,
        }
    }
}

/// Variables, inputs and outputs carried by the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContextData {
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub outputs: serde_json::Value,
}

/// Immutable snapshot of a run, taken for later restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub taken_at: DateTime<Utc>,
    pub state: RunState,
    pub current_location: Option<String>,
    pub context: RunContextData,
    pub completed_steps: usize,
}

/// Durable state machine record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub swarm_id: SwarmId,
    pub state: RunState,
    /// Optimistic-concurrency token for record commits.
    pub version: u64,
    pub context: RunContextData,
    pub current_location: Option<String>,
    pub branches: Vec<Branch>,
    pub step_executions: Vec<StepExecution>,
    pub checkpoints: Vec<Checkpoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(run_id: RunId, swarm_id: SwarmId, inputs: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            swarm_id,
            state: RunState::Pending,
            version: 1,
            context: RunContextData {
                variables: HashMap::new(),
                inputs,
                outputs: serde_json::Value::Null,
            },
            current_location: None,
            branches: vec![Branch::main()],
            step_executions: Vec::new(),
            checkpoints: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Guarded transition. Terminal states reject everything with
    /// [`RunError::AlreadyTerminal`] so racing callers can observe and back
    /// off instead of corrupting the record.
    pub fn transition_to(&mut self, next: RunState) -> Result<(), RunError> {
        if self.state.is_terminal() {
            return Err(RunError::AlreadyTerminal { state: self.state });
        }
        if !self.state.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move the main branch cursor.
    pub fn advance_to(&mut self, location: impl Into<String>) {
        let location = location.into();
        self.current_location = Some(location.clone());
        if let Some(main) = self.branches.iter_mut().find(|b| b.name == "main") {
            main.current_location = Some(location);
        }
        self.updated_at = Utc::now();
    }

    /// Snapshot the record into a new immutable checkpoint.
    pub fn take_checkpoint(&mut self) -> Checkpoint {
        let checkpoint = Checkpoint {
            checkpoint_id: CheckpointId::new(),
            taken_at: Utc::now(),
            state: self.state,
            current_location: self.current_location.clone(),
            context: self.context.clone(),
            completed_steps: self
                .step_executions
                .iter()
                .filter(|s| s.state == StepState::Completed)
                .count(),
        };
        self.checkpoints.push(checkpoint.clone());
        self.updated_at = Utc::now();
        checkpoint
    }

    /// Rewind the mutable portion of the record to `checkpoint_id`.
    ///
    /// The checkpoint list itself is append-only history and is never
    /// rewound. The restored record lands in `Paused` so the caller decides
    /// when to resume.
    pub fn restore_checkpoint(&mut self, checkpoint_id: CheckpointId) -> Result<(), RunError> {
        if self.state.is_terminal() {
            return Err(RunError::AlreadyTerminal { state: self.state });
        }
        let checkpoint = self
            .checkpoints
            .iter()
            .find(|c| c.checkpoint_id == checkpoint_id)
            .cloned()
            .ok_or(RunError::CheckpointNotFound { checkpoint_id })?;
        self.context = checkpoint.context;
        self.current_location = checkpoint.current_location.clone();
        if let Some(main) = self.branches.iter_mut().find(|b| b.name == "main") {
            main.current_location = checkpoint.current_location;
        }
        self.state = RunState::Paused;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn total_usage(&self) -> ResourceUsage {
        let mut total = ResourceUsage::default();
        for step in &self.step_executions {
            if let Some(usage) = &step.usage {
                total.credits_used = total.credits_used.saturating_add(usage.credits_used);
                total.elapsed_ms = total.elapsed_ms.saturating_add(usage.elapsed_ms);
                total.memory_peak_mb = total.memory_peak_mb.max(usage.memory_peak_mb);
            }
        }
        total
    }
}

/// Run state machine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("illegal run transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("run is already terminal ({state}); no further mutation")]
    AlreadyTerminal { state: RunState },

    #[error("checkpoint {checkpoint_id} not found")]
    CheckpointNotFound { checkpoint_id: CheckpointId },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RunRecord {
        RunRecord::new(RunId::new(), SwarmId::new(), serde_json::json!({"goal": "x"}))
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut run = record();
        run.transition_to(RunState::Running).unwrap();
        run.transition_to(RunState::Paused).unwrap();
        run.transition_to(RunState::Running).unwrap();
        run.transition_to(RunState::Completed).unwrap();
        assert!(run.state.is_terminal());
    }

    #[test]
    fn test_terminal_rejects_further_transitions() {
        let mut run = record();
        run.transition_to(RunState::Running).unwrap();
        run.transition_to(RunState::Cancelled).unwrap();
        let err = run.transition_to(RunState::Running).unwrap_err();
        assert_eq!(
            err,
            RunError::AlreadyTerminal {
                state: RunState::Cancelled
            }
        );
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut run = record();
        let err = run.transition_to(RunState::Paused).unwrap_err();
        assert_eq!(
            err,
            RunError::InvalidTransition {
                from: RunState::Pending,
                to: RunState::Paused
            }
        );
    }

    #[test]
    fn test_checkpoint_restore_rewinds_context() {
        let mut run = record();
        run.transition_to(RunState::Running).unwrap();
        run.advance_to("step-1");
        run.context
            .variables
            .insert("k".to_string(), serde_json::json!(1));
        let checkpoint = run.take_checkpoint();

        run.advance_to("step-2");
        run.context
            .variables
            .insert("k".to_string(), serde_json::json!(2));

        run.restore_checkpoint(checkpoint.checkpoint_id).unwrap();
        assert_eq!(run.state, RunState::Paused);
        assert_eq!(run.current_location.as_deref(), Some("step-1"));
        assert_eq!(run.context.variables["k"], serde_json::json!(1));
        // History is append-only.
        assert_eq!(run.checkpoints.len(), 1);
    }

    #[test]
    fn test_restore_unknown_checkpoint() {
        let mut run = record();
        run.transition_to(RunState::Running).unwrap();
        let missing = CheckpointId::new();
        let err = run.restore_checkpoint(missing).unwrap_err();
        assert_eq!(
            err,
            RunError::CheckpointNotFound {
                checkpoint_id: missing
            }
        );
    }

    #[test]
    fn test_total_usage_aggregates_steps() {
        let mut run = record();
        run.step_executions.push(StepExecution {
            step_id: StepId::new(),
            name: "a".to_string(),
            state: StepState::Completed,
            attempts: 1,
            allocation_id: None,
            usage: Some(ResourceUsage {
                credits_used: 100,
                elapsed_ms: 5,
                memory_peak_mb: 64,
            }),
            error: None,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
        });
        run.step_executions.push(StepExecution {
            step_id: StepId::new(),
            name: "b".to_string(),
            state: StepState::Failed,
            attempts: 2,
            allocation_id: None,
            usage: Some(ResourceUsage {
                credits_used: 40,
                elapsed_ms: 7,
                memory_peak_mb: 32,
            }),
            error: Some("boom".to_string()),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
        });
        let total = run.total_usage();
        assert_eq!(total.credits_used, 140);
        assert_eq!(total.elapsed_ms, 12);
        assert_eq!(total.memory_peak_mb, 64);
    }
}
