// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `hive-swarm` — Swarm Resource Coordination Crate
//!
//! Coordinates long-running, multi-step runs that share one finite
//! resource pool (credits, wall-clock time, memory, concurrency slots)
//! across a **swarm** of cooperating executions.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | run/step allocation views, run context snapshot |
//! | [`application`] | Application | context store, run context manager, run orchestrator |
//!
//! ## Key Concepts
//!
//! - **Swarm pool**: one versioned `SwarmContext` per swarm, mutated only
//!   through bounded compare-and-swap commits; conservation
//!   (`total = available + Σ allocations`) holds at every committed
//!   version.
//! - **Hierarchical budgets**: swarm → run → step. Step reservations are
//!   decremented from an in-process `remaining` view, so only the outer
//!   boundaries touch shared state.
//! - **Resilience path**: failures flow through the pure classifier and
//!   strategy selector in `hive-core`, updating per-component circuit
//!   breakers; the orchestrator applies the chosen recovery without ever
//!   corrupting the ledger.

pub mod application;
pub mod domain;

pub use application::*;
pub use domain::*;
