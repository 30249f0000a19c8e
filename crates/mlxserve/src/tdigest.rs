// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Streaming percentile sketch (t-digest).
//!
//! The QoS engine and the scheduler need percentiles over unbounded
//! observation streams without retaining every sample. This is the
//! standard merging t-digest: observations buffer until a threshold and
//! are then merged into centroids whose width is limited by the scale
//! function, keeping accuracy highest at the tails where SLOs live.

use serde::{Deserialize, Serialize};

const DEFAULT_COMPRESSION: f64 = 100.0;
const BUFFER_FACTOR: usize = 5;

/// A weighted centroid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Merging t-digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

impl TDigest {
    /// Create a digest. Higher `compression` means more centroids and
    /// better accuracy at more memory; 100 is the standard default.
    #[must_use]
    pub fn new(compression: f64) -> Self {
        let compression = if compression.is_finite() && compression >= 20.0 {
            compression
        } else {
            DEFAULT_COMPRESSION
        };
        Self {
            compression,
            centroids: Vec::new(),
            buffer: Vec::with_capacity(compression as usize * BUFFER_FACTOR),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Add one observation. Non-finite values are ignored.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.buffer.push(value);
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.buffer.len() >= (self.compression as usize) * BUFFER_FACTOR {
            self.compress();
        }
    }

    /// Number of observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of all observations.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Smallest observation.
    #[must_use]
    pub fn min(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.min
    }

    /// Largest observation.
    #[must_use]
    pub fn max(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.max
    }

    /// Merge buffered observations into the centroid set. Called
    /// automatically when the buffer fills; callers with a periodic
    /// maintenance tick invoke it directly so reads stay cheap.
    pub fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.merge_pass();
    }

    fn merge_pass(&mut self) {
        let mut merged: Vec<Centroid> = Vec::with_capacity(self.centroids.len() + self.buffer.len());
        merged.extend(self.centroids.iter().copied());
        merged.extend(self.buffer.drain(..).map(|v| Centroid { mean: v, weight: 1.0 }));
        merged.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let total: f64 = merged.iter().map(|c| c.weight).sum();
        let mut out: Vec<Centroid> = Vec::new();
        let mut seen = 0.0_f64;

        for centroid in merged {
            match out.last_mut() {
                Some(last) => {
                    let q = (seen + last.weight / 2.0) / total;
                    // k-size limit from the quadratic scale function:
                    // centroids may hold at most 4*n*q*(1-q)/compression
                    // weight, so tails stay narrow.
                    let limit = 4.0 * total * q * (1.0 - q) / self.compression;
                    if last.weight + centroid.weight <= limit.max(1.0) {
                        let w = last.weight + centroid.weight;
                        last.mean += (centroid.mean - last.mean) * centroid.weight / w;
                        last.weight = w;
                    } else {
                        seen += last.weight;
                        out.push(centroid);
                    }
                }
                None => out.push(centroid),
            }
        }
        self.centroids = out;
    }

    /// Estimate the value at quantile `q` in `[0, 1]`.
    #[must_use]
    pub fn percentile(&mut self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.compress();
        let q = q.clamp(0.0, 1.0);
        if q <= 0.0 {
            return self.min;
        }
        if q >= 1.0 {
            return self.max;
        }

        let total: f64 = self.centroids.iter().map(|c| c.weight).sum();
        let target = q * total;
        let mut seen = 0.0_f64;

        for (i, centroid) in self.centroids.iter().enumerate() {
            let center = seen + centroid.weight / 2.0;
            if target <= center {
                // Interpolate from the previous centroid's center.
                if i == 0 {
                    let prev_center = 0.0;
                    let frac = if center > prev_center {
                        (target - prev_center) / (center - prev_center)
                    } else {
                        1.0
                    };
                    return self.min + (centroid.mean - self.min) * frac.clamp(0.0, 1.0);
                }
                let prev = &self.centroids[i - 1];
                let prev_center = seen - prev.weight / 2.0;
                let frac = (target - prev_center) / (center - prev_center);
                return prev.mean + (centroid.mean - prev.mean) * frac.clamp(0.0, 1.0);
            }
            seen += centroid.weight;
        }
        self.max
    }

    /// Fold another digest into this one.
    pub fn merge_from(&mut self, other: &TDigest) {
        if other.count == 0 {
            return;
        }
        self.centroids.extend(other.centroids.iter().copied());
        self.buffer.extend(other.buffer.iter().copied());
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.merge_pass();
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.centroids.clear();
        self.buffer.clear();
        self.count = 0;
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest() {
        let mut digest = TDigest::default();
        assert_eq!(digest.count(), 0);
        assert_eq!(digest.mean(), 0.0);
        assert_eq!(digest.percentile(0.5), 0.0);
    }

    #[test]
    fn test_single_value() {
        let mut digest = TDigest::default();
        digest.add(42.0);
        assert_eq!(digest.count(), 1);
        assert_eq!(digest.mean(), 42.0);
        assert_eq!(digest.percentile(0.5), 42.0);
        assert_eq!(digest.min(), 42.0);
        assert_eq!(digest.max(), 42.0);
    }

    #[test]
    fn test_uniform_percentiles() {
        let mut digest = TDigest::default();
        for i in 1..=10_000 {
            digest.add(f64::from(i));
        }
        let p50 = digest.percentile(0.5);
        let p95 = digest.percentile(0.95);
        let p99 = digest.percentile(0.99);
        assert!((p50 - 5_000.0).abs() < 100.0, "p50 was {p50}");
        assert!((p95 - 9_500.0).abs() < 100.0, "p95 was {p95}");
        assert!((p99 - 9_900.0).abs() < 100.0, "p99 was {p99}");
    }

    #[test]
    fn test_extremes_are_exact() {
        let mut digest = TDigest::default();
        for i in 0..1_000 {
            digest.add(f64::from(i));
        }
        assert_eq!(digest.percentile(0.0), 0.0);
        assert_eq!(digest.percentile(1.0), 999.0);
        assert_eq!(digest.min(), 0.0);
        assert_eq!(digest.max(), 999.0);
    }

    #[test]
    fn test_compression_bounds_centroids() {
        let mut digest = TDigest::new(100.0);
        for i in 0..100_000 {
            digest.add(f64::from(i % 1_000));
        }
        digest.compress();
        // Centroid count stays within a small multiple of compression.
        assert!(digest.centroids.len() < 300, "{} centroids", digest.centroids.len());
        assert_eq!(digest.count(), 100_000);
    }

    #[test]
    fn test_skewed_distribution_tail() {
        let mut digest = TDigest::default();
        // 99% fast, 1% slow: the tail must be visible at p99.5.
        for _ in 0..9_900 {
            digest.add(10.0);
        }
        for _ in 0..100 {
            digest.add(5_000.0);
        }
        assert!(digest.percentile(0.5) < 50.0);
        assert!(digest.percentile(0.995) > 1_000.0);
    }

    #[test]
    fn test_non_finite_ignored() {
        let mut digest = TDigest::default();
        digest.add(f64::NAN);
        digest.add(f64::INFINITY);
        digest.add(1.0);
        assert_eq!(digest.count(), 1);
        assert_eq!(digest.mean(), 1.0);
    }

    #[test]
    fn test_clear_resets() {
        let mut digest = TDigest::default();
        digest.add(5.0);
        digest.clear();
        assert_eq!(digest.count(), 0);
        assert_eq!(digest.percentile(0.9), 0.0);
    }

    #[test]
    fn test_serde_snapshot() {
        let mut digest = TDigest::default();
        for i in 0..100 {
            digest.add(f64::from(i));
        }
        digest.compress();
        let json = serde_json::to_string(&digest).unwrap();
        let mut restored: TDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.count(), 100);
        assert!((restored.percentile(0.5) - digest.percentile(0.5)).abs() < 5.0);
    }

    #[test]
    fn test_merge_from() {
        let mut left = TDigest::default();
        let mut right = TDigest::default();
        for i in 0..5_000 {
            left.add(f64::from(i));
        }
        for i in 5_000..10_000 {
            right.add(f64::from(i));
        }
        left.merge_from(&right);
        assert_eq!(left.count(), 10_000);
        let p50 = left.percentile(0.5);
        assert!((p50 - 5_000.0).abs() < 150.0, "p50 was {p50}");
        assert_eq!(left.max(), 9_999.0);
    }
}
