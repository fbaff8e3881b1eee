// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Durable run context snapshot handed to step executors and mirrored in
//! the key-value store with a TTL refreshed from the run allocation's
//! expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use hive_core::domain::run::RunId;

/// Point-in-time view of a run's variables and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContextSnapshot {
    pub run_id: RunId,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    pub current_location: Option<String>,
    pub completed_steps: u32,
    pub credits_used: u128,
    pub updated_at: DateTime<Utc>,
}

impl RunContextSnapshot {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            variables: HashMap::new(),
            current_location: None,
            completed_steps: 0,
            credits_used: 0,
            updated_at: Utc::now(),
        }
    }
}
