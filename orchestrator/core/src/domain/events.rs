// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Engine Lifecycle Events
//!
//! Events emitted by the coordination engine to the notification interface:
//! run lifecycle transitions and resource pool movements. Each variant
//! carries its own timestamp; `kind()` gives the stable wire name consumers
//! filter on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::SwarmId;
use crate::domain::resources::{
    AllocationId, ConsumerType, ResourceKind, ResourceQuantity, ResourceUsage,
};
use crate::domain::run::{CheckpointId, RunId};

/// Run state machine transitions, as seen by external consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunLifecycleEvent {
    RunStarted {
        run_id: RunId,
        swarm_id: SwarmId,
        started_at: DateTime<Utc>,
    },
    RunPaused {
        run_id: RunId,
        reason: Option<String>,
        paused_at: DateTime<Utc>,
    },
    RunResumed {
        run_id: RunId,
        resumed_at: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        swarm_id: SwarmId,
        total_steps: u32,
        usage: ResourceUsage,
        completed_at: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        swarm_id: SwarmId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    RunCancelled {
        run_id: RunId,
        swarm_id: SwarmId,
        reason: Option<String>,
        cancelled_at: DateTime<Utc>,
    },
    CheckpointTaken {
        run_id: RunId,
        checkpoint_id: CheckpointId,
        taken_at: DateTime<Utc>,
    },
}

impl RunLifecycleEvent {
    /// Stable wire name for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            RunLifecycleEvent::RunStarted { .. } => "RUN.STARTED",
            RunLifecycleEvent::RunPaused { .. } => "RUN.PAUSED",
            RunLifecycleEvent::RunResumed { .. } => "RUN.RESUMED",
            RunLifecycleEvent::RunCompleted { .. } => "RUN.COMPLETED",
            RunLifecycleEvent::RunFailed { .. } => "RUN.FAILED",
            RunLifecycleEvent::RunCancelled { .. } => "RUN.CANCELLED",
            RunLifecycleEvent::CheckpointTaken { .. } => "RUN.CHECKPOINT",
        }
    }
}

/// Resource pool movements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceEvent {
    ResourceAllocated {
        swarm_id: SwarmId,
        allocation_id: AllocationId,
        consumer_id: String,
        consumer_type: ConsumerType,
        allocated: ResourceQuantity,
        allocated_at: DateTime<Utc>,
    },
    ResourceReleased {
        swarm_id: SwarmId,
        allocation_id: AllocationId,
        returned: ResourceQuantity,
        released_at: DateTime<Utc>,
    },
    ResourceExhausted {
        swarm_id: SwarmId,
        resource: ResourceKind,
        requested: u128,
        available: u128,
        observed_at: DateTime<Utc>,
    },
    AllocationExpired {
        swarm_id: SwarmId,
        allocation_id: AllocationId,
        reclaimed: ResourceQuantity,
        expired_at: DateTime<Utc>,
    },
}

impl ResourceEvent {
    /// Stable wire name for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceEvent::ResourceAllocated { .. } => "RESOURCE.ALLOCATED",
            ResourceEvent::ResourceReleased { .. } => "RESOURCE.RELEASED",
            ResourceEvent::ResourceExhausted { .. } => "RESOURCE.EXHAUSTED",
            ResourceEvent::AllocationExpired { .. } => "RESOURCE.EXPIRED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_event_serialization_round_trip() {
        let event = RunLifecycleEvent::RunStarted {
            run_id: RunId::new(),
            swarm_id: SwarmId::new(),
            started_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: RunLifecycleEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert_eq!(event.kind(), "RUN.STARTED");
    }

    #[test]
    fn test_resource_exhausted_carries_numbers() {
        let event = ResourceEvent::ResourceExhausted {
            swarm_id: SwarmId::new(),
            resource: ResourceKind::Credits,
            requested: 3000,
            available: 2700,
            observed_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("3000"));
        assert!(json.contains("2700"));
        assert_eq!(event.kind(), "RESOURCE.EXHAUSTED");
    }
}
