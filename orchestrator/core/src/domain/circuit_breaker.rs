// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Circuit Breaker
//!
//! Per-component failure/success state machine protecting collaborators
//! from being hammered while unhealthy. Pure state plus a clock: the
//! caller's clock is injected through the `*_at` methods, and the
//! plain methods use the system clock.
//!
//! ## Transitions
//!
//! | From | To | When |
//! |------|----|------|
//! | Closed | Open | `failure_threshold` failures inside `monitoring_window` |
//! | Open | HalfOpen | `reset_timeout` elapsed, checked lazily on the next call |
//! | HalfOpen | Closed | `success_threshold` consecutive successes |
//! | HalfOpen | Open | any single failure |
//!
//! The Open→HalfOpen edge is evaluated on the next `try_acquire`, never by
//! a background timer, so a breaker cannot leave orphaned tasks behind.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Breaker admission states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        write!(f, "{}", name)
    }
}

/// What the caller should do with requests rejected while Open. The
/// breaker itself only decides admit/reject; queueing or fallback handlers
/// are supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMode {
    #[default]
    FailFast,
    QueueRequests,
    UseFallback,
    PartialService,
}

/// Breaker tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_reset_timeout", with = "humantime_serde")]
    pub reset_timeout: Duration,
    #[serde(default = "default_monitoring_window", with = "humantime_serde")]
    pub monitoring_window: Duration,
    #[serde(default)]
    pub degradation_mode: DegradationMode,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_monitoring_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout: default_reset_timeout(),
            monitoring_window: default_monitoring_window(),
            degradation_mode: DegradationMode::default(),
        }
    }
}

/// Admission denied while the breaker is Open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for {component}; retry after {retry_after_ms}ms")]
pub struct CircuitOpenError {
    pub component: String,
    pub retry_after_ms: u64,
    pub degradation_mode: DegradationMode,
}

/// Serializable snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub component_key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub state_change_time: DateTime<Utc>,
    pub next_retry_time: Option<DateTime<Utc>>,
}

/// One breaker instance, owned by exactly one registry entry.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    component_key: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    state_change_time: DateTime<Utc>,
    next_retry_time: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(component_key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            component_key: component_key.into(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
            state_change_time: Utc::now(),
            next_retry_time: None,
        }
    }

    pub fn component_key(&self) -> &str {
        &self.component_key
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Ask for admission using the system clock.
    pub fn try_acquire(&mut self) -> Result<(), CircuitOpenError> {
        self.try_acquire_at(Utc::now())
    }

    /// Ask for admission at an explicit instant.
    pub fn try_acquire_at(&mut self, now: DateTime<Utc>) -> Result<(), CircuitOpenError> {
        if self.state == CircuitState::Open {
            let retry_at = self
                .next_retry_time
                .unwrap_or(self.state_change_time + self.reset_timeout());
            if now >= retry_at {
                self.transition(CircuitState::HalfOpen, now);
            } else {
                let retry_after_ms = (retry_at - now).num_milliseconds().max(0) as u64;
                return Err(CircuitOpenError {
                    component: self.component_key.clone(),
                    retry_after_ms,
                    degradation_mode: self.config.degradation_mode,
                });
            }
        }
        Ok(())
    }

    pub fn record_success(&mut self) {
        self.record_success_at(Utc::now());
    }

    pub fn record_success_at(&mut self, now: DateTime<Utc>) {
        self.last_success_time = Some(now);
        match self.state {
            CircuitState::Closed => {
                // A success closes out the current failure streak.
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.transition(CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {
                // Success reported against an open breaker (late completion);
                // ignored, the reset timeout governs recovery.
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Utc::now());
    }

    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        match self.state {
            CircuitState::Closed => {
                // Failures outside the monitoring window start a new streak.
                if let Some(last) = self.last_failure_time {
                    if now - last > self.monitoring_window() {
                        self.failure_count = 0;
                    }
                }
                self.last_failure_time = Some(now);
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.trip_at(now);
                }
            }
            CircuitState::HalfOpen => {
                self.last_failure_time = Some(now);
                self.failure_count += 1;
                self.trip_at(now);
            }
            CircuitState::Open => {
                self.last_failure_time = Some(now);
            }
        }
    }

    /// Force the breaker Open, e.g. when the recovery selector decides to
    /// circuit-break explicitly.
    pub fn trip(&mut self) {
        self.trip_at(Utc::now());
    }

    pub fn trip_at(&mut self, now: DateTime<Utc>) {
        warn!(
            component = %self.component_key,
            failures = self.failure_count,
            "circuit breaker tripped open"
        );
        self.transition(CircuitState::Open, now);
        self.next_retry_time = Some(now + self.reset_timeout());
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            component_key: self.component_key.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            state_change_time: self.state_change_time,
            next_retry_time: self.next_retry_time,
        }
    }

    fn transition(&mut self, next: CircuitState, now: DateTime<Utc>) {
        if self.state != next {
            debug!(
                component = %self.component_key,
                from = %self.state,
                to = %next,
                "circuit breaker transition"
            );
            metrics::counter!("hive_circuit_breaker_transitions_total").increment(1);
        }
        self.state = next;
        self.state_change_time = now;
        match next {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.next_retry_time = None;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn reset_timeout(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.reset_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(30))
    }

    fn monitoring_window(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.monitoring_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(60))
    }
}

/// Keyed table of breakers, one per monitored component, created lazily.
///
/// Breaker state is process-local by design: each orchestrator protects its
/// own calls, so no cross-process coordination is required.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, Arc<Mutex<CircuitBreaker>>>>,
    default_config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            default_config,
        }
    }

    /// Fetch (or lazily create) the breaker for `component_key`.
    pub fn breaker(&self, component_key: &str) -> Arc<Mutex<CircuitBreaker>> {
        self.breakers
            .entry(component_key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(
                    component_key,
                    self.default_config.clone(),
                )))
            })
            .clone()
    }

    pub fn snapshot(&self, component_key: &str) -> Option<CircuitBreakerState> {
        self.breakers
            .get(component_key)
            .map(|b| b.lock().snapshot())
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
