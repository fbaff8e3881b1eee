// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Recovery Strategy Selection
//!
//! Pure ranking of recovery actions for a classified failure. The selector
//! never mutates shared state; the orchestrator applies the chosen
//! strategy's side effects (releasing budget, retrying, tripping the
//! breaker, pausing the run).
//!
//! Eligibility is constrained by three inputs:
//! - the classification's recoverability,
//! - the strategies already exhausted for this error context (a strategy is
//!   never repeated once exhausted),
//! - the live circuit-breaker state for the failing component (while Open,
//!   only stop/escalate actions are eligible).

use serde::{Deserialize, Serialize};

use crate::domain::circuit_breaker::CircuitState;
use crate::domain::classification::{
    ErrorCategory, ErrorClassification, ErrorSeverity, Recoverability,
};

/// The closed set of recovery actions the engine can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetrySame,
    WaitAndRetry,
    RetryModified,
    FallbackStrategy,
    FallbackModel,
    ReduceScope,
    GracefulDegradation,
    EscalateToParent,
    EscalateToHuman,
    EmergencyStop,
    CircuitBreak,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecoveryStrategy::RetrySame => "retry_same",
            RecoveryStrategy::WaitAndRetry => "wait_and_retry",
            RecoveryStrategy::RetryModified => "retry_modified",
            RecoveryStrategy::FallbackStrategy => "fallback_strategy",
            RecoveryStrategy::FallbackModel => "fallback_model",
            RecoveryStrategy::ReduceScope => "reduce_scope",
            RecoveryStrategy::GracefulDegradation => "graceful_degradation",
            RecoveryStrategy::EscalateToParent => "escalate_to_parent",
            RecoveryStrategy::EscalateToHuman => "escalate_to_human",
            RecoveryStrategy::EmergencyStop => "emergency_stop",
            RecoveryStrategy::CircuitBreak => "circuit_break",
        };
        write!(f, "{}", name)
    }
}

/// Pick the next strategy for a classified failure.
///
/// `exhausted` lists strategies already spent for this error context; the
/// selector walks its candidate ladder and returns the first strategy not
/// yet exhausted. When every candidate is spent the selection degrades to
/// `EscalateToHuman`, and finally `EmergencyStop` — the two actions that
/// are always legal.
pub fn select_strategy(
    classification: &ErrorClassification,
    exhausted: &[RecoveryStrategy],
    breaker_state: Option<CircuitState>,
) -> RecoveryStrategy {
    use RecoveryStrategy::*;

    // Fatal severity ends the run, full stop.
    if classification.severity == ErrorSeverity::Fatal {
        return EmergencyStop;
    }

    // An open breaker leaves only stop/escalate on the table.
    if breaker_state == Some(CircuitState::Open) {
        return first_eligible(&[EscalateToParent, EscalateToHuman, EmergencyStop], exhausted);
    }

    // Critical security failures halt before anything else leaks.
    if classification.category == ErrorCategory::Security
        && classification.severity == ErrorSeverity::Critical
    {
        return first_eligible(&[EmergencyStop, EscalateToHuman], exhausted);
    }

    let ladder: &[RecoveryStrategy] = match classification.recoverability {
        Recoverability::None => &[EscalateToHuman, EmergencyStop],
        Recoverability::Manual => &[EscalateToHuman, EscalateToParent, EmergencyStop],
        Recoverability::Partial => &[
            FallbackStrategy,
            FallbackModel,
            ReduceScope,
            GracefulDegradation,
            EscalateToParent,
            EscalateToHuman,
        ],
        Recoverability::Automatic => match classification.category {
            ErrorCategory::Transient => &[
                WaitAndRetry,
                RetrySame,
                RetryModified,
                FallbackModel,
                CircuitBreak,
                EscalateToParent,
            ],
            ErrorCategory::Resource => &[
                ReduceScope,
                WaitAndRetry,
                FallbackModel,
                GracefulDegradation,
                EscalateToParent,
            ],
            ErrorCategory::System => &[
                RetrySame,
                WaitAndRetry,
                FallbackStrategy,
                CircuitBreak,
                EscalateToParent,
            ],
            _ => &[
                RetrySame,
                RetryModified,
                FallbackStrategy,
                GracefulDegradation,
                EscalateToParent,
            ],
        },
    };

    first_eligible(ladder, exhausted)
}

fn first_eligible(
    ladder: &[RecoveryStrategy],
    exhausted: &[RecoveryStrategy],
) -> RecoveryStrategy {
    ladder
        .iter()
        .copied()
        .find(|s| !exhausted.contains(s))
        .unwrap_or({
            if exhausted.contains(&RecoveryStrategy::EscalateToHuman) {
                RecoveryStrategy::EmergencyStop
            } else {
                RecoveryStrategy::EscalateToHuman
            }
        })
}
