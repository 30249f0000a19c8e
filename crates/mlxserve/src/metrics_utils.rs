// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

// Allow expect() in this module: used for fallback metric creation where
// the fallback name is guaranteed to be valid (e.g., "{name}_invalid").
#![allow(clippy::expect_used)]

//! Safe Prometheus metric registration helpers.
//!
//! mlxserve is a library embedded in multiple binaries. When more than
//! one component registers the same metric name, the default Prometheus
//! registry returns an error and the upstream `register_*` macros panic
//! on it. These helpers log and continue instead, returning the already
//! registered metric (or an unregistered fallback) so telemetry can
//! never take down the control plane.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts};
use std::sync::LazyLock;
use tracing::{debug, warn};

#[derive(Clone)]
struct CounterEntry {
    metric: Counter,
}

#[derive(Clone)]
struct GaugeEntry {
    metric: Gauge,
}

#[derive(Clone)]
struct HistogramEntry {
    metric: Histogram,
}

#[derive(Clone)]
struct CounterVecEntry {
    metric: CounterVec,
}

#[derive(Clone)]
struct GaugeVecEntry {
    metric: GaugeVec,
}

#[derive(Clone)]
struct HistogramVecEntry {
    metric: HistogramVec,
}

static COUNTERS: LazyLock<DashMap<String, CounterEntry>> = LazyLock::new(DashMap::new);
static GAUGES: LazyLock<DashMap<String, GaugeEntry>> = LazyLock::new(DashMap::new);
static HISTOGRAMS: LazyLock<DashMap<String, HistogramEntry>> = LazyLock::new(DashMap::new);
static COUNTER_VECS: LazyLock<DashMap<String, CounterVecEntry>> = LazyLock::new(DashMap::new);
static GAUGE_VECS: LazyLock<DashMap<String, GaugeVecEntry>> = LazyLock::new(DashMap::new);
static HISTOGRAM_VECS: LazyLock<DashMap<String, HistogramVecEntry>> = LazyLock::new(DashMap::new);

fn register(name: &str, collector: Box<dyn prometheus::core::Collector>) {
    if let Err(e) = prometheus::default_registry().register(collector) {
        match e {
            prometheus::Error::AlreadyReg => {
                debug!(metric = name, "Metric already registered; continuing");
            }
            other => {
                warn!(
                    metric = name,
                    error = %other,
                    "Metric registration failed; continuing without global registration"
                );
            }
        }
    }
}

pub(crate) fn counter(name: &str, help: &str) -> Counter {
    match COUNTERS.entry(name.to_string()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let metric = Counter::new(name, help).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "Failed to create Counter");
                Counter::new(format!("{name}_invalid"), help)
                    .expect("fallback counter name should be valid")
            });
            register(name, Box::new(metric.clone()));
            entry.insert(CounterEntry {
                metric: metric.clone(),
            });
            metric
        }
    }
}

pub(crate) fn gauge(name: &str, help: &str) -> Gauge {
    match GAUGES.entry(name.to_string()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let metric = Gauge::new(name, help).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "Failed to create Gauge");
                Gauge::new(format!("{name}_invalid"), help)
                    .expect("fallback gauge name should be valid")
            });
            register(name, Box::new(metric.clone()));
            entry.insert(GaugeEntry {
                metric: metric.clone(),
            });
            metric
        }
    }
}

pub(crate) fn histogram(opts: HistogramOpts) -> Histogram {
    let name = opts.common_opts.name.clone();
    match HISTOGRAMS.entry(name.clone()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let fallback_opts = HistogramOpts::new(
                format!("{name}_invalid"),
                opts.common_opts.help.clone(),
            );
            let metric = Histogram::with_opts(opts).unwrap_or_else(|e| {
                warn!(metric = name.as_str(), error = %e, "Failed to create Histogram");
                Histogram::with_opts(fallback_opts)
                    .expect("fallback histogram name should be valid")
            });
            register(&name, Box::new(metric.clone()));
            entry.insert(HistogramEntry {
                metric: metric.clone(),
            });
            metric
        }
    }
}

pub(crate) fn counter_vec(opts: Opts, labels: &[&str]) -> CounterVec {
    let name = opts.name.clone();
    match COUNTER_VECS.entry(name.clone()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let fallback_opts = Opts::new(format!("{name}_invalid"), opts.help.clone());
            let metric = CounterVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = name.as_str(), error = %e, "Failed to create CounterVec");
                CounterVec::new(fallback_opts, labels)
                    .expect("fallback counter vec name should be valid")
            });
            register(&name, Box::new(metric.clone()));
            entry.insert(CounterVecEntry {
                metric: metric.clone(),
            });
            metric
        }
    }
}

pub(crate) fn gauge_vec(opts: Opts, labels: &[&str]) -> GaugeVec {
    let name = opts.name.clone();
    match GAUGE_VECS.entry(name.clone()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let fallback_opts = Opts::new(format!("{name}_invalid"), opts.help.clone());
            let metric = GaugeVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = name.as_str(), error = %e, "Failed to create GaugeVec");
                GaugeVec::new(fallback_opts, labels)
                    .expect("fallback gauge vec name should be valid")
            });
            register(&name, Box::new(metric.clone()));
            entry.insert(GaugeVecEntry {
                metric: metric.clone(),
            });
            metric
        }
    }
}

pub(crate) fn histogram_vec(opts: HistogramOpts, labels: &[&str]) -> HistogramVec {
    let name = opts.common_opts.name.clone();
    match HISTOGRAM_VECS.entry(name.clone()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let fallback_opts = HistogramOpts::new(
                format!("{name}_invalid"),
                opts.common_opts.help.clone(),
            );
            let metric = HistogramVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = name.as_str(), error = %e, "Failed to create HistogramVec");
                HistogramVec::new(fallback_opts, labels)
                    .expect("fallback histogram vec name should be valid")
            });
            register(&name, Box::new(metric.clone()));
            entry.insert(HistogramVecEntry {
                metric: metric.clone(),
            });
            metric
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_registration_is_idempotent() {
        let a = counter("mlxserve_test_idempotent_total", "test counter");
        let b = counter("mlxserve_test_idempotent_total", "test counter");
        a.inc();
        b.inc();
        assert_eq!(a.get(), 2.0);
    }

    #[test]
    fn test_counter_vec_label_values() {
        let vec = counter_vec(
            Opts::new("mlxserve_test_labels_total", "test"),
            &["component"],
        );
        vec.with_label_values(&["scheduler"]).inc();
        vec.with_label_values(&["scheduler"]).inc();
        vec.with_label_values(&["queue"]).inc();
        assert_eq!(vec.with_label_values(&["scheduler"]).get(), 2.0);
        assert_eq!(vec.with_label_values(&["queue"]).get(), 1.0);
    }

    #[test]
    fn test_histogram_observation() {
        let h = histogram(HistogramOpts::new(
            "mlxserve_test_duration_ms",
            "test histogram",
        ));
        h.observe(5.0);
        h.observe(15.0);
        assert_eq!(h.get_sample_count(), 2);
    }
}
