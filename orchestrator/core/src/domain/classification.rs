// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Error Classification Domain Service
//!
//! Pure, deterministic mapping from a raw step failure plus its execution
//! context to an [`ErrorClassification`]. No I/O, no clocks, no shared
//! state — the same inputs always produce the same classification, which
//! keeps the whole resilience path unit-testable.
//!
//! Rules are evaluated in a fixed order; the first match drives the
//! classification, and every additional match lowers the confidence score
//! (an ambiguous failure is a less trustworthy classification).

use serde::{Deserialize, Serialize};

/// How bad it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Fatal,
    Critical,
    Error,
    Warning,
    Info,
}

/// What kind of failure it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Resource,
    Logic,
    Configuration,
    Security,
    Data,
    System,
    Unknown,
}

/// Whether and how the engine can recover without a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recoverability {
    Automatic,
    Partial,
    Manual,
    None,
}

/// The classifier's verdict. Derived, never persisted on its own; attached
/// to resilience events for audit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub recoverability: Recoverability,
    /// In `[0, 1]`; lowered when multiple rules matched.
    pub confidence_score: f64,
}

/// Structured hint a step executor may attach to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionLost,
    BudgetExceeded,
    AccessDenied,
    InvalidInput,
    InvalidConfiguration,
    DataCorruption,
    Internal,
}

/// Typed failure returned by a step-execution collaborator.
///
/// The orchestrator never interprets business semantics; it sees only the
/// failure shape and the resources the attempt consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    /// Executor's own opinion; `Some(false)` vetoes automatic recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default)]
    pub usage: crate::domain::resources::ResourceUsage,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: None,
            usage: Default::default(),
        }
    }

    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Execution context the classifier weighs alongside the raw failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Component key of the failing collaborator (circuit breaker key).
    pub component: String,
    /// 1-based attempt number for this step.
    pub attempt: u32,
    pub max_attempts: u32,
    /// The run's credit budget is fully spent.
    pub budget_exhausted: bool,
    pub remaining_credits: u128,
}

impl FailureContext {
    pub fn retries_remain(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

const SECURITY_SIGNALS: &[&str] = &[
    "unauthorized",
    "permission denied",
    "forbidden",
    "credential",
    "invalid token",
    "signature",
];
const RESOURCE_SIGNALS: &[&str] = &[
    "insufficient",
    "budget",
    "quota",
    "out of memory",
    "credit",
    "exhausted",
];
const TRANSIENT_SIGNALS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "unavailable",
    "try again",
    "rate limit",
];
const CONFIGURATION_SIGNALS: &[&str] = &[
    "missing configuration",
    "misconfigured",
    "unknown option",
    "environment variable",
];
const DATA_SIGNALS: &[&str] = &["parse", "malformed", "corrupt", "schema", "deserialize"];
const LOGIC_SIGNALS: &[&str] = &[
    "assertion",
    "invariant",
    "panicked",
    "unreachable",
    "index out of bounds",
];
const SYSTEM_SIGNALS: &[&str] = &["io error", "os error", "broken pipe", "signal"];

fn matches_any(haystack: &str, signals: &[&str]) -> bool {
    signals.iter().any(|s| haystack.contains(s))
}

/// Classify a failure. Pure function; see module docs for rule ordering.
pub fn classify(failure: &StepFailure, ctx: &FailureContext) -> ErrorClassification {
    let message = failure.message.to_lowercase();

    struct Rule {
        matched: bool,
        severity: ErrorSeverity,
        category: ErrorCategory,
        recoverability: Recoverability,
        base_confidence: f64,
    }

    let automatic_if_retries = |hard_stop: bool| {
        if hard_stop || !ctx.retries_remain() {
            Recoverability::Manual
        } else {
            Recoverability::Automatic
        }
    };

    let rules = [
        Rule {
            matched: failure.kind == Some(FailureKind::AccessDenied)
                || matches_any(&message, SECURITY_SIGNALS),
            severity: ErrorSeverity::Critical,
            category: ErrorCategory::Security,
            recoverability: Recoverability::Manual,
            base_confidence: 0.95,
        },
        Rule {
            matched: failure.kind == Some(FailureKind::BudgetExceeded)
                || ctx.budget_exhausted
                || matches_any(&message, RESOURCE_SIGNALS),
            severity: if ctx.budget_exhausted {
                ErrorSeverity::Critical
            } else {
                ErrorSeverity::Error
            },
            category: ErrorCategory::Resource,
            recoverability: automatic_if_retries(ctx.budget_exhausted),
            base_confidence: 0.9,
        },
        Rule {
            matched: matches!(
                failure.kind,
                Some(FailureKind::Timeout) | Some(FailureKind::ConnectionLost)
            ) || matches_any(&message, TRANSIENT_SIGNALS),
            severity: ErrorSeverity::Error,
            category: ErrorCategory::Transient,
            recoverability: automatic_if_retries(false),
            base_confidence: 0.85,
        },
        Rule {
            matched: failure.kind == Some(FailureKind::InvalidConfiguration)
                || matches_any(&message, CONFIGURATION_SIGNALS),
            severity: ErrorSeverity::Error,
            category: ErrorCategory::Configuration,
            recoverability: Recoverability::Manual,
            base_confidence: 0.8,
        },
        Rule {
            matched: matches!(
                failure.kind,
                Some(FailureKind::DataCorruption) | Some(FailureKind::InvalidInput)
            ) || matches_any(&message, DATA_SIGNALS),
            severity: ErrorSeverity::Error,
            category: ErrorCategory::Data,
            recoverability: Recoverability::Partial,
            base_confidence: 0.75,
        },
        Rule {
            matched: matches_any(&message, LOGIC_SIGNALS),
            severity: ErrorSeverity::Critical,
            category: ErrorCategory::Logic,
            recoverability: Recoverability::Manual,
            base_confidence: 0.8,
        },
        Rule {
            matched: failure.kind == Some(FailureKind::Internal)
                || matches_any(&message, SYSTEM_SIGNALS),
            severity: ErrorSeverity::Error,
            category: ErrorCategory::System,
            recoverability: Recoverability::Partial,
            base_confidence: 0.7,
        },
    ];

    let match_count = rules.iter().filter(|r| r.matched).count();
    let primary = rules.iter().find(|r| r.matched);

    let mut classification = match primary {
        Some(rule) => ErrorClassification {
            severity: rule.severity,
            category: rule.category,
            recoverability: rule.recoverability,
            confidence_score: rule.base_confidence,
        },
        None => ErrorClassification {
            severity: ErrorSeverity::Error,
            category: ErrorCategory::Unknown,
            recoverability: Recoverability::Partial,
            confidence_score: 0.5,
        },
    };

    // Ambiguity penalty: each extra matching rule costs confidence.
    if match_count > 1 {
        let penalty = 0.15 * (match_count as f64 - 1.0);
        classification.confidence_score = (classification.confidence_score - penalty).max(0.3);
    }

    // An executor that says "not retryable" overrides automatic recovery.
    if failure.retryable == Some(false)
        && classification.recoverability == Recoverability::Automatic
    {
        classification.recoverability = Recoverability::Partial;
    }

    classification
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FailureContext {
        FailureContext {
            component: "llm-gateway".to_string(),
            attempt: 1,
            max_attempts: 3,
            budget_exhausted: false,
            remaining_credits: 1000,
        }
    }

    #[test]
    fn test_security_signals_trump_everything() {
        let failure = StepFailure::new("permission denied while reading tool output: timeout");
        let c = classify(&failure, &ctx());
        assert_eq!(c.category, ErrorCategory::Security);
        assert_eq!(c.severity, ErrorSeverity::Critical);
        assert_eq!(c.recoverability, Recoverability::Manual);
        // Matched both security and transient signals.
        assert!(c.confidence_score < 0.95);
    }

    #[test]
    fn test_budget_error_automatic_while_retries_remain() {
        let failure = StepFailure::new("insufficient credits for model call")
            .with_kind(FailureKind::BudgetExceeded);
        let c = classify(&failure, &ctx());
        assert_eq!(c.category, ErrorCategory::Resource);
        assert_eq!(c.recoverability, Recoverability::Automatic);
    }

    #[test]
    fn test_budget_error_manual_when_retries_exhausted() {
        let failure = StepFailure::new("insufficient credits for model call");
        let mut context = ctx();
        context.attempt = 3;
        let c = classify(&failure, &context);
        assert_eq!(c.recoverability, Recoverability::Manual);
    }

    #[test]
    fn test_budget_exhaustion_is_critical() {
        let failure = StepFailure::new("no credits left");
        let mut context = ctx();
        context.budget_exhausted = true;
        context.remaining_credits = 0;
        let c = classify(&failure, &context);
        assert_eq!(c.category, ErrorCategory::Resource);
        assert_eq!(c.severity, ErrorSeverity::Critical);
        assert_eq!(c.recoverability, Recoverability::Manual);
    }

    #[test]
    fn test_unknown_failure_defaults() {
        let failure = StepFailure::new("something odd happened");
        let c = classify(&failure, &ctx());
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert_eq!(c.severity, ErrorSeverity::Error);
        assert_eq!(c.recoverability, Recoverability::Partial);
        assert_eq!(c.confidence_score, 0.5);
    }

    #[test]
    fn test_executor_retryable_veto() {
        let failure = StepFailure {
            message: "upstream timed out".to_string(),
            kind: Some(FailureKind::Timeout),
            retryable: Some(false),
            usage: Default::default(),
        };
        let c = classify(&failure, &ctx());
        assert_eq!(c.category, ErrorCategory::Transient);
        assert_eq!(c.recoverability, Recoverability::Partial);
    }

    #[test]
    fn test_deterministic() {
        let failure = StepFailure::new("connection reset by peer");
        let a = classify(&failure, &ctx());
        let b = classify(&failure, &ctx());
        assert_eq!(a, b);
    }
}
