// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Feature flags with deterministic percentage rollout.
//!
//! Each flag buckets an identifier the same way the canary router does,
//! so a feature ramps over a stable population. The emergency block is
//! an operator big red button: the kill switch disables every flag, and
//! `rollback_to_baseline` forces canary routing off.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// One feature's rollout state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlag {
    /// Disabled flags never activate regardless of percentage
    pub enabled: bool,
    /// Fraction of identifiers the feature activates for, in `[0, 100]`
    pub rollout_percentage: f64,
    /// Seed mixed into the bucket hash
    pub hash_seed: String,
}

impl Default for FeatureFlag {
    fn default() -> Self {
        Self {
            enabled: false,
            rollout_percentage: 0.0,
            hash_seed: "mlxserve".to_string(),
        }
    }
}

/// Emergency overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Disables every flag at once
    pub kill_switch: bool,
    /// Forces canary routing to the baseline variant
    pub rollback_to_baseline: bool,
}

/// Feature flag configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlagsConfig {
    /// Flags by name
    pub flags: HashMap<String, FeatureFlag>,
    /// Emergency overrides
    pub emergency: EmergencyConfig,
}

impl FeatureFlagsConfig {
    /// Validate rollout percentages.
    ///
    /// # Errors
    ///
    /// `InvalidParams` naming the offending flag.
    pub fn validate(&self) -> Result<()> {
        for (name, flag) in &self.flags {
            if !(0.0..=100.0).contains(&flag.rollout_percentage) {
                return Err(Error::InvalidParams(format!(
                    "feature_flags.{name}.rollout_percentage must be within [0, 100]"
                )));
            }
        }
        Ok(())
    }
}

/// Flag evaluation surface.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    config: FeatureFlagsConfig,
}

impl FeatureFlags {
    /// Build from validated config.
    #[must_use]
    pub fn new(config: FeatureFlagsConfig) -> Self {
        Self { config }
    }

    /// Whether canary routing is being forced to baseline.
    #[must_use]
    pub fn rollback_to_baseline(&self) -> bool {
        self.config.emergency.rollback_to_baseline
    }

    /// Evaluate a flag for an identifier.
    #[must_use]
    pub fn is_enabled(&self, name: &str, identifier: &str) -> bool {
        if self.config.emergency.kill_switch {
            return false;
        }
        let Some(flag) = self.config.flags.get(name) else {
            return false;
        };
        if !flag.enabled || flag.rollout_percentage <= 0.0 {
            return false;
        }
        if flag.rollout_percentage >= 100.0 {
            return true;
        }

        let mut hasher = Sha256::new();
        hasher.update(flag.hash_seed.as_bytes());
        hasher.update(name.as_bytes());
        hasher.update(identifier.as_bytes());
        let digest = hasher.finalize();
        let word = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        let bucket = (word % 10_000) as f64;
        bucket < flag.rollout_percentage * 100.0
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn flags_with(name: &str, flag: FeatureFlag) -> FeatureFlags {
        let mut config = FeatureFlagsConfig::default();
        config.flags.insert(name.to_string(), flag);
        FeatureFlags::new(config)
    }

    #[test]
    fn test_unknown_flag_is_off() {
        let flags = FeatureFlags::new(FeatureFlagsConfig::default());
        assert!(!flags.is_enabled("nope", "user-1"));
    }

    #[test]
    fn test_full_rollout() {
        let flags = flags_with(
            "speculative_decoding",
            FeatureFlag {
                enabled: true,
                rollout_percentage: 100.0,
                hash_seed: "s".to_string(),
            },
        );
        for i in 0..50 {
            assert!(flags.is_enabled("speculative_decoding", &format!("u-{i}")));
        }
    }

    #[test]
    fn test_partial_rollout_deterministic_and_proportional() {
        let flags = flags_with(
            "f",
            FeatureFlag {
                enabled: true,
                rollout_percentage: 30.0,
                hash_seed: "s".to_string(),
            },
        );
        let on = (0..10_000)
            .filter(|i| flags.is_enabled("f", &format!("u-{i}")))
            .count() as f64
            / 10_000.0;
        assert!((0.27..=0.33).contains(&on), "30% rollout hit {on}");
        // Deterministic per identifier.
        assert_eq!(flags.is_enabled("f", "u-7"), flags.is_enabled("f", "u-7"));
    }

    #[test]
    fn test_disabled_flag_ignores_percentage() {
        let flags = flags_with(
            "f",
            FeatureFlag {
                enabled: false,
                rollout_percentage: 100.0,
                hash_seed: "s".to_string(),
            },
        );
        assert!(!flags.is_enabled("f", "u-1"));
    }

    #[test]
    fn test_kill_switch_overrides_everything() {
        let mut config = FeatureFlagsConfig::default();
        config.flags.insert(
            "f".to_string(),
            FeatureFlag {
                enabled: true,
                rollout_percentage: 100.0,
                hash_seed: "s".to_string(),
            },
        );
        config.emergency.kill_switch = true;
        let flags = FeatureFlags::new(config);
        assert!(!flags.is_enabled("f", "u-1"));
    }

    #[test]
    fn test_validation_rejects_bad_percentage() {
        let mut config = FeatureFlagsConfig::default();
        config.flags.insert(
            "f".to_string(),
            FeatureFlag {
                enabled: true,
                rollout_percentage: 120.0,
                hash_seed: "s".to_string(),
            },
        );
        assert!(config.validate().is_err());
    }
}
