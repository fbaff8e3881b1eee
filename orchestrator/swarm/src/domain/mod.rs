// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Value objects local to swarm coordination: run/step allocation views
//! over the core resource ledger, and the durable run context snapshot.

pub mod allocation_view;
pub mod snapshot;

pub use allocation_view::{
    RunAllocation, RunBudgetError, RunResourceRequest, StepAllocation, StepResourceRequest,
};
pub use snapshot::RunContextSnapshot;
