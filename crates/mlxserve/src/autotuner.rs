// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Concurrency Auto-Tuning
//!
//! Fixed tier caps are often suboptimal: too high and the worker thrashes
//! under memory pressure, too low and the hardware idles. This module
//! detects the host hardware at startup, derives baseline tier caps, and
//! then adjusts them from observed health samples:
//!
//! 1. **Detect hardware** - chip family, core counts, unified memory
//! 2. **Recommend baselines** - scale the default caps to the hardware
//! 3. **Adjust at runtime** - grow caps up to 20% when the worker is
//!    healthy, shrink by 30% on failures, latency, memory pressure, or
//!    any crash
//!
//! Learned caps persist per hardware fingerprint under the user profile
//! directory and are discarded when the fingerprint changes.

use crate::error::Result;
use crate::limiter::{ModelTier, TierLimit, TierLimitsConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Grow step applied to a healthy tier.
const SCALE_UP_FACTOR: f64 = 1.2;
/// Shrink step applied to an unhealthy tier.
const SCALE_DOWN_FACTOR: f64 = 0.7;
/// Success rate above which growth is considered.
const HEALTHY_SUCCESS_RATE: f64 = 0.98;
/// Unhealthy when success drops below this.
const UNHEALTHY_SUCCESS_RATE: f64 = 0.90;
/// Memory pressure above which the tier shrinks.
const MEMORY_PRESSURE_LIMIT: f64 = 0.85;
/// p95 latency budget multiplier: above `2x` average is "high".
const LATENCY_SPIKE_RATIO: f64 = 2.0;

/// Detected host hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    /// Chip marketing name (e.g. "Apple M3 Max"), or a generic tag
    pub chip: String,
    /// CPU core count
    pub cpu_cores: u32,
    /// GPU core count when detectable, zero otherwise
    pub gpu_cores: u32,
    /// Unified memory in gigabytes
    pub unified_memory_gb: f64,
}

impl HardwareProfile {
    /// Detect the host. Best-effort `sysctl` probing on macOS; a
    /// conservative generic profile elsewhere.
    #[must_use]
    pub fn detect() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);

        #[cfg(target_os = "macos")]
        {
            let chip = sysctl_string("machdep.cpu.brand_string")
                .unwrap_or_else(|| "Apple Silicon".to_string());
            let memory_bytes = sysctl_string("hw.memsize")
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(8 * 1024 * 1024 * 1024);
            Self {
                chip,
                cpu_cores,
                gpu_cores: 0,
                unified_memory_gb: memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            }
        }

        #[cfg(not(target_os = "macos"))]
        {
            Self {
                chip: "generic".to_string(),
                cpu_cores,
                gpu_cores: 0,
                unified_memory_gb: 8.0,
            }
        }
    }

    /// Stable fingerprint of this hardware; keys the learned profile.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.chip.as_bytes());
        hasher.update(self.cpu_cores.to_le_bytes());
        hasher.update(self.gpu_cores.to_le_bytes());
        hasher.update((self.unified_memory_gb as u64).to_le_bytes());
        hex::encode(&hasher.finalize()[..12])
    }

    /// Baseline tier caps scaled to this hardware. The defaults target
    /// a 16 GB host; memory headroom scales the small tiers first since
    /// large models are bound by a single resident copy.
    #[must_use]
    pub fn baseline_limits(&self) -> TierLimitsConfig {
        let mut limits = TierLimitsConfig::default();
        let memory_factor = (self.unified_memory_gb / 16.0).clamp(0.25, 4.0);
        for tier in ModelTier::ALL {
            let base = limits.get(tier);
            let scaled = match tier {
                ModelTier::Xl30BPlus => base.max_concurrent,
                _ => ((base.max_concurrent as f64 * memory_factor).round() as usize).max(1),
            };
            limits.set(
                tier,
                TierLimit {
                    max_concurrent: scaled,
                    ..base
                },
            );
        }
        limits
    }
}

#[cfg(target_os = "macos")]
fn sysctl_string(name: &str) -> Option<String> {
    let output = std::process::Command::new("sysctl")
        .arg("-n")
        .arg(name)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// A runtime health sample for one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    /// Fraction of requests that succeeded
    pub success_rate: f64,
    /// Mean latency in milliseconds
    pub avg_latency_ms: f64,
    /// p95 latency in milliseconds
    pub p95_latency_ms: f64,
    /// Worker memory pressure in `[0, 1]`
    pub memory_pressure: f64,
    /// Worker crashes since the previous sample
    pub recent_crashes: u32,
}

/// Direction of a recommended change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningDirection {
    /// Grow the cap
    Increase,
    /// Shrink the cap
    Decrease,
    /// Leave the cap alone
    Hold,
}

/// One tuning recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningRecommendation {
    /// Tier under adjustment
    pub tier: ModelTier,
    /// Cap before
    pub current: usize,
    /// Cap after
    pub recommended: usize,
    /// Direction
    pub direction: TuningDirection,
    /// Operator-facing reason
    pub reason: String,
}

/// A persisted learned profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedProfile {
    /// Hardware fingerprint this profile was learned on
    pub hardware_fingerprint: String,
    /// Learned tier caps
    pub limits: TierLimitsConfig,
    /// Last update timestamp
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// The auto-tuner.
pub struct AutoTuner {
    hardware: HardwareProfile,
    profile_dir: Option<PathBuf>,
}

impl AutoTuner {
    /// Create a tuner for detected hardware, persisting profiles under
    /// `~/.mlxserve/profiles`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hardware(HardwareProfile::detect())
    }

    /// Create for explicit hardware (tests, remote workers).
    #[must_use]
    pub fn with_hardware(hardware: HardwareProfile) -> Self {
        let profile_dir = dirs::home_dir().map(|home| home.join(".mlxserve").join("profiles"));
        Self {
            hardware,
            profile_dir,
        }
    }

    /// Override the profile directory (tests).
    #[must_use]
    pub fn with_profile_dir(mut self, dir: PathBuf) -> Self {
        self.profile_dir = Some(dir);
        self
    }

    /// Detected hardware.
    #[must_use]
    pub fn hardware(&self) -> &HardwareProfile {
        &self.hardware
    }

    /// Starting caps: the learned profile when one matches the current
    /// hardware fingerprint, the hardware baseline otherwise.
    #[must_use]
    pub fn initial_limits(&self) -> TierLimitsConfig {
        match self.load_profile() {
            Some(profile) if profile.hardware_fingerprint == self.hardware.fingerprint() => {
                info!(
                    fingerprint = %profile.hardware_fingerprint,
                    "Restored learned concurrency profile"
                );
                profile.limits
            }
            Some(_) => {
                info!("Hardware changed; discarding learned concurrency profile");
                self.hardware.baseline_limits()
            }
            None => self.hardware.baseline_limits(),
        }
    }

    /// Evaluate one health sample against the tier's current cap.
    #[must_use]
    pub fn recommend(
        &self,
        tier: ModelTier,
        current: usize,
        sample: &HealthSample,
    ) -> TuningRecommendation {
        let latency_spiked = sample.p95_latency_ms
            > sample.avg_latency_ms * LATENCY_SPIKE_RATIO + f64::EPSILON
            && sample.avg_latency_ms > 0.0;

        let unhealthy = sample.recent_crashes > 0
            || sample.success_rate < UNHEALTHY_SUCCESS_RATE
            || sample.memory_pressure > MEMORY_PRESSURE_LIMIT
            || latency_spiked;

        if unhealthy {
            let recommended = ((current as f64 * SCALE_DOWN_FACTOR).floor() as usize).max(1);
            let reason = if sample.recent_crashes > 0 {
                format!("{} crashes since last sample", sample.recent_crashes)
            } else if sample.memory_pressure > MEMORY_PRESSURE_LIMIT {
                format!("memory pressure {:.2}", sample.memory_pressure)
            } else if sample.success_rate < UNHEALTHY_SUCCESS_RATE {
                format!("success rate {:.3}", sample.success_rate)
            } else {
                format!("p95 {:.0}ms over budget", sample.p95_latency_ms)
            };
            return TuningRecommendation {
                tier,
                current,
                recommended,
                direction: if recommended < current {
                    TuningDirection::Decrease
                } else {
                    TuningDirection::Hold
                },
                reason,
            };
        }

        let healthy = sample.success_rate > HEALTHY_SUCCESS_RATE
            && sample.recent_crashes == 0
            && !latency_spiked
            && sample.memory_pressure < MEMORY_PRESSURE_LIMIT * 0.8;

        if healthy {
            let recommended = ((current as f64 * SCALE_UP_FACTOR).ceil() as usize).max(current + 1);
            return TuningRecommendation {
                tier,
                current,
                recommended,
                direction: TuningDirection::Increase,
                reason: format!(
                    "success {:.3}, no crashes, latency within budget",
                    sample.success_rate
                ),
            };
        }

        TuningRecommendation {
            tier,
            current,
            recommended: current,
            direction: TuningDirection::Hold,
            reason: "within healthy band".to_string(),
        }
    }

    /// Persist learned caps for the current hardware.
    ///
    /// # Errors
    ///
    /// `Io` or `Json` when the profile cannot be written.
    pub fn save_profile(&self, limits: &TierLimitsConfig) -> Result<()> {
        let Some(dir) = &self.profile_dir else {
            debug!("No profile directory; skipping profile save");
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let profile = LearnedProfile {
            hardware_fingerprint: self.hardware.fingerprint(),
            limits: limits.clone(),
            updated_at: chrono::Utc::now(),
        };
        let path = dir.join(format!("{}.json", profile.hardware_fingerprint));
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&profile)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "Learned concurrency profile saved");
        Ok(())
    }

    fn load_profile(&self) -> Option<LearnedProfile> {
        let dir = self.profile_dir.as_ref()?;
        let path = dir.join(format!("{}.json", self.hardware.fingerprint()));
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt learned profile");
                None
            }
        }
    }
}

impl Default for AutoTuner {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn hw(memory_gb: f64) -> HardwareProfile {
        HardwareProfile {
            chip: "Apple M3 Max".to_string(),
            cpu_cores: 12,
            gpu_cores: 38,
            unified_memory_gb: memory_gb,
        }
    }

    fn healthy_sample() -> HealthSample {
        HealthSample {
            success_rate: 0.995,
            avg_latency_ms: 200.0,
            p95_latency_ms: 320.0,
            memory_pressure: 0.4,
            recent_crashes: 0,
        }
    }

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let a = hw(64.0).fingerprint();
        let b = hw(64.0).fingerprint();
        let c = hw(128.0).fingerprint();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_baseline_scales_with_memory() {
        let small = hw(8.0).baseline_limits();
        let large = hw(128.0).baseline_limits();
        assert!(
            large.get(ModelTier::Sub3B).max_concurrent
                > small.get(ModelTier::Sub3B).max_concurrent
        );
        // The 30B+ tier stays at the default regardless of memory.
        assert_eq!(
            large.get(ModelTier::Xl30BPlus).max_concurrent,
            TierLimitsConfig::default().get(ModelTier::Xl30BPlus).max_concurrent
        );
    }

    #[test]
    fn test_healthy_sample_scales_up() {
        let tuner = AutoTuner::with_hardware(hw(64.0));
        let rec = tuner.recommend(ModelTier::Md7To13B, 4, &healthy_sample());
        assert_eq!(rec.direction, TuningDirection::Increase);
        assert_eq!(rec.recommended, 5); // ceil(4 * 1.2)
    }

    #[test]
    fn test_crash_scales_down() {
        let tuner = AutoTuner::with_hardware(hw(64.0));
        let mut sample = healthy_sample();
        sample.recent_crashes = 1;
        let rec = tuner.recommend(ModelTier::Md7To13B, 4, &sample);
        assert_eq!(rec.direction, TuningDirection::Decrease);
        assert_eq!(rec.recommended, 2); // floor(4 * 0.7)
        assert!(rec.reason.contains("crash"));
    }

    #[test]
    fn test_memory_pressure_scales_down() {
        let tuner = AutoTuner::with_hardware(hw(64.0));
        let mut sample = healthy_sample();
        sample.memory_pressure = 0.92;
        let rec = tuner.recommend(ModelTier::Sm3To7B, 8, &sample);
        assert_eq!(rec.direction, TuningDirection::Decrease);
        assert_eq!(rec.recommended, 5);
    }

    #[test]
    fn test_scale_down_floors_at_one() {
        let tuner = AutoTuner::with_hardware(hw(64.0));
        let mut sample = healthy_sample();
        sample.success_rate = 0.5;
        let rec = tuner.recommend(ModelTier::Xl30BPlus, 1, &sample);
        assert_eq!(rec.recommended, 1);
        assert_eq!(rec.direction, TuningDirection::Hold);
    }

    #[test]
    fn test_middling_sample_holds() {
        let tuner = AutoTuner::with_hardware(hw(64.0));
        let mut sample = healthy_sample();
        sample.success_rate = 0.95; // between the bands
        let rec = tuner.recommend(ModelTier::Md7To13B, 4, &sample);
        assert_eq!(rec.direction, TuningDirection::Hold);
        assert_eq!(rec.recommended, 4);
    }

    #[test]
    fn test_profile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tuner =
            AutoTuner::with_hardware(hw(64.0)).with_profile_dir(dir.path().to_path_buf());

        let mut limits = TierLimitsConfig::default();
        limits.md_7_to_13b.max_concurrent = 9;
        tuner.save_profile(&limits).unwrap();

        let restored = tuner.initial_limits();
        assert_eq!(restored.get(ModelTier::Md7To13B).max_concurrent, 9);
    }

    #[test]
    fn test_profile_invalidated_on_hardware_change() {
        let dir = tempfile::tempdir().unwrap();
        let tuner_a =
            AutoTuner::with_hardware(hw(64.0)).with_profile_dir(dir.path().to_path_buf());
        let mut limits = TierLimitsConfig::default();
        limits.sub_3b.max_concurrent = 99;
        tuner_a.save_profile(&limits).unwrap();

        // Different memory: different fingerprint, baseline applies.
        let tuner_b =
            AutoTuner::with_hardware(hw(128.0)).with_profile_dir(dir.path().to_path_buf());
        let restored = tuner_b.initial_limits();
        assert_ne!(restored.get(ModelTier::Sub3B).max_concurrent, 99);
    }
}
