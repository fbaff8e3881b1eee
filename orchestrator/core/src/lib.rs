// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `hive-orchestrator-core` — Coordination Engine Primitives
//!
//! Core domain and infrastructure primitives for the HIVE swarm
//! coordinator: exact resource-ledger arithmetic, the versioned swarm
//! context aggregate, run records, failure classification, recovery
//! strategy selection, circuit breaking, the persistence/transport port,
//! and the engine event bus.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model + ports consumed by `hive-orchestrator-swarm`

pub mod domain;
pub mod infrastructure;

pub use domain::*;
