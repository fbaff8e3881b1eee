// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Engine Configuration Types
//
// Defines the configuration schema for the HIVE coordination engine:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Optimistic-concurrency retry policy (bounded attempts, capped backoff)
// - Circuit breaker defaults
// - Durable run-mirror TTL bounds
// - Event bus and lock lease tuning

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::domain::circuit_breaker::CircuitBreakerConfig;

pub const ENGINE_CONFIG_API_VERSION: &str = "100monkeys.ai/v1";
pub const ENGINE_CONFIG_KIND: &str = "EngineConfig";

/// Top-level Kubernetes-style engine configuration manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "EngineConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: EngineConfig,
}

/// Manifest metadata (Kubernetes-style).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Engine tuning knobs (content under spec:).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounded retry for versioned compare-and-swap commits.
    #[serde(default)]
    pub cas_retry: RetryPolicy,

    /// Defaults applied to lazily created circuit breakers.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Clamp for the durable run-mirror TTL derived from requested duration.
    #[serde(default)]
    pub run_mirror_ttl: TtlBounds,

    /// Broadcast capacity of the engine event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Lease granted to distributed locks; a crashed holder blocks at most
    /// this long.
    #[serde(default = "default_lock_lease", with = "humantime_serde")]
    pub lock_lease: Duration,

    /// Default timeout applied to barrier arrivals when the caller does not
    /// provide one.
    #[serde(default = "default_barrier_timeout", with = "humantime_serde")]
    pub barrier_timeout: Duration,
}

fn default_event_bus_capacity() -> usize {
    1000
}
fn default_lock_lease() -> Duration {
    Duration::from_secs(30)
}
fn default_barrier_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cas_retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            run_mirror_ttl: TtlBounds::default(),
            event_bus_capacity: default_event_bus_capacity(),
            lock_lease: default_lock_lease(),
            barrier_timeout: default_barrier_timeout(),
        }
    }
}

impl EngineConfig {
    /// Parse a manifest from YAML and validate its envelope.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let manifest: EngineConfigManifest = serde_yaml::from_str(yaml)?;
        if manifest.api_version != ENGINE_CONFIG_API_VERSION {
            return Err(ConfigError::UnsupportedApiVersion {
                found: manifest.api_version,
            });
        }
        if manifest.kind != ENGINE_CONFIG_KIND {
            return Err(ConfigError::UnsupportedKind {
                found: manifest.kind,
            });
        }
        Ok(manifest.spec)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }
}

/// Bounded retry with capped exponential backoff.
///
/// The ceiling and backoff constants are deliberate configuration, not
/// call-site defaults: 5 attempts, 10 ms base, 2x multiplier, 250 ms cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> Duration {
    Duration::from_millis(10)
}
fn default_multiplier() -> u32 {
    2
}
fn default_max_delay() -> Duration {
    Duration::from_millis(250)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given 1-based attempt (no delay before the first).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(2).min(16);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(exponent);
        let delay = self
            .base_delay
            .saturating_mul(factor.min(u32::MAX as u64) as u32);
        delay.min(self.max_delay)
    }
}

/// Clamp applied to TTLs derived from caller-requested durations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlBounds {
    #[serde(default = "default_ttl_min", with = "humantime_serde")]
    pub min: Duration,
    #[serde(default = "default_ttl_max", with = "humantime_serde")]
    pub max: Duration,
}

fn default_ttl_min() -> Duration {
    Duration::from_secs(30)
}
fn default_ttl_max() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for TtlBounds {
    fn default() -> Self {
        Self {
            min: default_ttl_min(),
            max: default_ttl_max(),
        }
    }
}

impl TtlBounds {
    pub fn clamp(&self, requested: Duration) -> Duration {
        requested.clamp(self.min, self.max)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported apiVersion '{found}' (expected {ENGINE_CONFIG_API_VERSION})")]
    UnsupportedApiVersion { found: String },

    #[error("unsupported kind '{found}' (expected {ENGINE_CONFIG_KIND})")]
    UnsupportedKind { found: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"
apiVersion: 100monkeys.ai/v1
kind: EngineConfig
metadata:
  name: staging
spec:
  cas_retry:
    max_attempts: 7
    base_delay: 5ms
    max_delay: 100ms
  circuit_breaker:
    failure_threshold: 3
    reset_timeout: 10s
  run_mirror_ttl:
    min: 1m
    max: 2h
  lock_lease: 15s
"#;

    #[test]
    fn test_parse_manifest() {
        let config = EngineConfig::from_yaml_str(MANIFEST).unwrap();
        assert_eq!(config.cas_retry.max_attempts, 7);
        assert_eq!(config.cas_retry.base_delay, Duration::from_millis(5));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.run_mirror_ttl.min, Duration::from_secs(60));
        assert_eq!(config.lock_lease, Duration::from_secs(15));
        // Unspecified fields fall back to defaults.
        assert_eq!(config.event_bus_capacity, 1000);
        assert_eq!(config.cas_retry.multiplier, 2);
    }

    #[test]
    fn test_rejects_wrong_api_version() {
        let yaml = MANIFEST.replace("100monkeys.ai/v1", "100monkeys.ai/v0");
        let err = EngineConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedApiVersion { .. }));
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let yaml = MANIFEST.replace("kind: EngineConfig", "kind: NodeConfig");
        let err = EngineConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedKind { .. }));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();
        let config = EngineConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.cas_retry.max_attempts, 7);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(10));
        assert_eq!(policy.delay_before(3), Duration::from_millis(20));
        assert_eq!(policy.delay_before(4), Duration::from_millis(40));
        // Capped at max_delay no matter how far attempts go.
        assert_eq!(policy.delay_before(12), Duration::from_millis(250));
    }

    #[test]
    fn test_ttl_clamp() {
        let bounds = TtlBounds::default();
        assert_eq!(bounds.clamp(Duration::from_secs(1)), Duration::from_secs(30));
        assert_eq!(
            bounds.clamp(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
        assert_eq!(
            bounds.clamp(Duration::from_secs(48 * 3600)),
            Duration::from_secs(24 * 3600)
        );
    }
}
