//! Controller configuration
//!
//! The configuration is read once at startup (YAML file, then CLI/env
//! overrides) and injected into the reconcile context as an immutable value.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Default namespace holding MachineSets on OpenShift
pub const DEFAULT_MACHINESET_NAMESPACE: &str = "openshift-machine-api";

/// Default ceiling on managed replicas
pub const DEFAULT_MAX_SCALEOUT_ALLOWED: u32 = 15;

/// How machine pools are shared between workloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineSetsStrategy {
    /// Scale existing pools of the requested instance type, shared by reference
    #[default]
    Reuse,
    /// Create one pool per workload pod group, deleted with the workload
    Dedicated,
}

impl fmt::Display for MachineSetsStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reuse => write!(f, "reuse"),
            Self::Dedicated => write!(f, "dedicated"),
        }
    }
}

impl FromStr for MachineSetsStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reuse" => Ok(Self::Reuse),
            "dedicated" => Ok(Self::Dedicated),
            other => Err(Error::validation_for_field(
                "machineSetsStrategy",
                format!("unknown strategy '{other}', expected 'reuse' or 'dedicated'"),
            )),
        }
    }
}

/// What happens to a shared pool when the workload holding its high-water mark leaves
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedPoolShrink {
    /// Scale down to the largest demand among the remaining workloads
    #[default]
    Recompute,
    /// Leave the pool as is until the next scale-out touches it
    Retain,
}

impl FromStr for SharedPoolShrink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "recompute" => Ok(Self::Recompute),
            "retain" => Ok(Self::Retain),
            other => Err(Error::validation_for_field(
                "sharedPoolShrink",
                format!("unknown policy '{other}', expected 'recompute' or 'retain'"),
            )),
        }
    }
}

/// Backoff applied to transient failures
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_secs: u64,
    /// Upper bound for the doubling delay
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: 1,
            max_secs: 300,
        }
    }
}

/// InstaScale controller configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstaScaleConfig {
    /// Pool sharing strategy
    pub machine_sets_strategy: MachineSetsStrategy,
    /// Ceiling on replicas across controller-managed pools
    pub max_scaleout_allowed: u32,
    /// Namespace where MachineSets live
    pub machine_set_namespace: String,
    /// Shared pool shrink policy on teardown
    pub shared_pool_shrink: SharedPoolShrink,
    /// Deadline for each API call
    pub api_timeout_secs: u64,
    /// Requeue delay after a ceiling rejection
    pub ceiling_backoff_secs: u64,
    /// Backoff for transient API failures
    pub transient_backoff: BackoffConfig,
}

impl Default for InstaScaleConfig {
    fn default() -> Self {
        Self {
            machine_sets_strategy: MachineSetsStrategy::default(),
            max_scaleout_allowed: DEFAULT_MAX_SCALEOUT_ALLOWED,
            machine_set_namespace: DEFAULT_MACHINESET_NAMESPACE.to_string(),
            shared_pool_shrink: SharedPoolShrink::default(),
            api_timeout_secs: 30,
            ceiling_backoff_secs: 60,
            transient_backoff: BackoffConfig::default(),
        }
    }
}

impl InstaScaleConfig {
    /// Parse a configuration from YAML, filling unspecified fields with defaults
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::serialization_for_kind("InstaScaleConfig", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_scaleout_allowed == 0 {
            return Err(Error::validation_for_field(
                "maxScaleoutAllowed",
                "must be at least 1",
            ));
        }
        if self.machine_set_namespace.is_empty() {
            return Err(Error::validation_for_field(
                "machineSetNamespace",
                "must not be empty",
            ));
        }
        if self.api_timeout_secs == 0 {
            return Err(Error::validation_for_field(
                "apiTimeoutSecs",
                "must be at least 1",
            ));
        }
        if self.ceiling_backoff_secs == 0 {
            return Err(Error::validation_for_field(
                "ceilingBackoffSecs",
                "must be at least 1",
            ));
        }
        if self.transient_backoff.initial_secs == 0
            || self.transient_backoff.max_secs < self.transient_backoff.initial_secs
        {
            return Err(Error::validation_for_field(
                "transientBackoff",
                "initialSecs must be positive and not exceed maxSecs",
            ));
        }
        Ok(())
    }

    /// Deadline for each API call
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Requeue delay after a ceiling rejection
    pub fn ceiling_backoff(&self) -> Duration {
        Duration::from_secs(self.ceiling_backoff_secs)
    }

    /// Initial and maximum transient backoff
    pub fn transient_backoff_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.transient_backoff.initial_secs),
            Duration::from_secs(self.transient_backoff.max_secs),
        )
    }
}
