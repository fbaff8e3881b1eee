// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Application Layer
//!
//! The three coordination services, outermost first:
//!
//! | Service | Responsibility |
//! |---------|----------------|
//! | [`orchestrator::RunOrchestrator`] | run state machine + resilience loop |
//! | [`run_context::RunContextManager`] | run/step budget sub-allocation |
//! | [`context_store::SwarmContextManager`] | versioned pool, locks, barriers, subscriptions |

pub mod context_store;
pub mod orchestrator;
pub mod run_context;

pub use context_store::{
    Barrier, BarrierError, ContextStoreError, ContextSubscription, DistributedLock,
    SwarmContextManager,
};
pub use orchestrator::{
    OrchestratorError, RunDefinition, RunOrchestrator, StepAttempt, StepDefinition, StepExecutor,
    StepOutcome,
};
pub use run_context::{RunContextError, RunContextManager};
