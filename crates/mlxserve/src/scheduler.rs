// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Priority Scheduler - Five Levels, Aging, Fairness, SLA Deadlines
//!
//! Per-level FIFO queues with a bounded execution window. Selection
//! normally takes the highest non-empty level; a configurable fraction
//! of decisions is forced to the lowest non-empty level so BACKGROUND
//! work keeps moving, and queued requests age one level toward CRITICAL
//! when their wait crosses the level's threshold.
//!
//! Preemption is admission-time: in-flight work always finishes, but a
//! higher-priority arrival into a full window displaces the
//! longest-waiting lower-priority ticket's turn; displaced tickets get
//! an effective-priority bump as compensation and the displacement is
//! recorded.

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::metrics_constants::{
    METRIC_AGING_BUMPS_TOTAL, METRIC_FAIRNESS_INTERVENTIONS_TOTAL, METRIC_PREEMPTIONS_TOTAL,
    METRIC_SCHEDULER_QUEUE_DEPTH, METRIC_SCHEDULER_WAIT_MS, METRIC_SLA_VIOLATIONS_TOTAL,
};
use crate::tdigest::TDigest;
use parking_lot::Mutex;
use prometheus::{Counter, CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    crate::metrics_utils::gauge_vec(
        Opts::new(METRIC_SCHEDULER_QUEUE_DEPTH, "Queued requests per priority level"),
        &["level"],
    )
});
static WAIT_MS: LazyLock<HistogramVec> = LazyLock::new(|| {
    crate::metrics_utils::histogram_vec(
        HistogramOpts::new(METRIC_SCHEDULER_WAIT_MS, "Scheduler wait time in milliseconds")
            .buckets(vec![1.0, 5.0, 25.0, 100.0, 500.0, 2500.0, 10000.0, 60000.0]),
        &["level"],
    )
});
static SLA_VIOLATIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_SLA_VIOLATIONS_TOTAL, "SLA deadline violations"),
        &["level"],
    )
});
static AGING_BUMPS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_AGING_BUMPS_TOTAL, "Requests promoted by aging")
});
static FAIRNESS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(
        METRIC_FAIRNESS_INTERVENTIONS_TOTAL,
        "Forced low-priority scheduling decisions",
    )
});
static PREEMPTIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_PREEMPTIONS_TOTAL, "Admission-time preemptions"),
        &["level"],
    )
});

/// Request priority; 0 is highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Interactive, latency-critical
    Critical = 0,
    /// Interactive
    High = 1,
    /// Default
    Normal = 2,
    /// Deferred work
    Low = 3,
    /// Bulk/offline work
    Background = 4,
}

impl Priority {
    /// All levels, highest first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Index into per-level storage.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// One step toward CRITICAL.
    #[must_use]
    pub fn bumped(self) -> Priority {
        match self {
            Priority::Critical | Priority::High => Priority::Critical,
            Priority::Normal => Priority::High,
            Priority::Low => Priority::Normal,
            Priority::Background => Priority::Low,
        }
    }

    fn from_index(index: usize) -> Priority {
        Priority::ALL[index.min(4)]
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

struct Ticket {
    original: Priority,
    enqueued_at: Instant,
    deadline: Option<Instant>,
    displaced_at: Option<Instant>,
    go: oneshot::Sender<DispatchOutcome>,
}

enum DispatchOutcome {
    Run {
        effective: Priority,
        sla_overage: Option<Duration>,
    },
    DroppedExpired {
        overage: Duration,
    },
}

#[derive(Default)]
struct Counters {
    aging_bumps: u64,
    fairness_interventions: u64,
    total_preemptions: u64,
    preemptions_by_priority: [u64; 5],
    preemption_wait_total: Duration,
    sla_violations: [u64; 5],
    dispatched: [u64; 5],
    max_wait: [Duration; 5],
}

struct SchedulerInner {
    queues: [VecDeque<Ticket>; 5],
    active: usize,
    counters: Counters,
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Queue depth per level, CRITICAL first
    pub queue_depths: [usize; 5],
    /// Currently executing requests
    pub active: usize,
    /// Requests promoted by aging
    pub aging_bumps: u64,
    /// Forced low-priority decisions
    pub fairness_interventions: u64,
    /// Admission-time preemptions
    pub total_preemptions: u64,
    /// Preemptions by displaced level
    pub preemptions_by_priority: [u64; 5],
    /// Mean displacement-to-dispatch time in milliseconds
    pub avg_preemption_duration_ms: f64,
    /// Deadline violations per level
    pub sla_violations: [u64; 5],
    /// Dispatched requests per level
    pub throughput_by_priority: [u64; 5],
    /// Longest observed wait per level in milliseconds
    pub max_wait_by_priority_ms: [u64; 5],
    /// Wait percentiles per level: (p50, p95, p99) in milliseconds
    pub wait_percentiles_ms: [(f64, f64, f64); 5],
}

/// The scheduler.
pub struct PriorityScheduler {
    config: SchedulerConfig,
    inner: Mutex<SchedulerInner>,
    wait_digests: Mutex<[TDigest; 5]>,
}

/// An execution slot. Dropping it releases the window and dispatches
/// the next queued ticket.
pub struct SchedulerPermit {
    scheduler: Arc<PriorityScheduler>,
    /// Effective priority at dispatch (after aging)
    pub effective_priority: Priority,
    /// Deadline overage when the request was dispatched past its SLA
    pub sla_overage: Option<Duration>,
}

impl std::fmt::Debug for SchedulerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerPermit")
            .field("effective_priority", &self.effective_priority)
            .field("sla_overage", &self.sla_overage)
            .finish()
    }
}

impl PriorityScheduler {
    /// Build from config.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(SchedulerInner {
                queues: Default::default(),
                active: 0,
                counters: Counters::default(),
            }),
            wait_digests: Mutex::new(std::array::from_fn(|_| TDigest::default())),
        })
    }

    /// Wait for an execution slot at `priority`.
    ///
    /// # Errors
    ///
    /// `Timeout` (as an SLA drop) when the deadline passed while queued
    /// and the config says to drop expired requests; `Cancelled` when
    /// the scheduler shut down while the ticket was queued.
    pub async fn schedule(
        self: &Arc<Self>,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> Result<SchedulerPermit> {
        let (go_tx, go_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();

            // Admission-time preemption: a full window plus queued
            // lower-priority work means this arrival takes the slot
            // that would have gone to the displaced ticket. The
            // displaced ticket is bumped one level as compensation,
            // but never into the arrival's own level, where it would
            // queue ahead of the work that displaced it.
            if inner.active >= self.config.max_concurrent {
                let displaced_level = (priority.index() + 1..5)
                    .find(|&level| !inner.queues[level].is_empty());
                if let Some(level) = displaced_level {
                    if let Some(mut ticket) = inner.queues[level].pop_front() {
                        if ticket.displaced_at.is_none() {
                            ticket.displaced_at = Some(Instant::now());
                            inner.counters.total_preemptions += 1;
                            inner.counters.preemptions_by_priority[level] += 1;
                            PREEMPTIONS
                                .with_label_values(&[&Priority::from_index(level).to_string()])
                                .inc();
                        }
                        let target = (level - 1).max(priority.index() + 1);
                        inner.queues[target.min(level)].push_back(ticket);
                    }
                }
            }

            inner.queues[priority.index()].push_back(Ticket {
                original: priority,
                enqueued_at: Instant::now(),
                deadline,
                displaced_at: None,
                go: go_tx,
            });
            QUEUE_DEPTH
                .with_label_values(&[&priority.to_string()])
                .set(inner.queues[priority.index()].len() as f64);
        }
        self.dispatch();

        match go_rx.await {
            Ok(DispatchOutcome::Run {
                effective,
                sla_overage,
            }) => Ok(SchedulerPermit {
                scheduler: Arc::clone(self),
                effective_priority: effective,
                sla_overage,
            }),
            Ok(DispatchOutcome::DroppedExpired { overage }) => Err(Error::Timeout {
                method: "sla_deadline".to_string(),
                request_id: 0,
                elapsed_ms: overage.as_millis() as u64,
            }),
            Err(_) => Err(Error::Cancelled("scheduler shut down".to_string())),
        }
    }

    /// Promote queued tickets whose wait crossed their level threshold.
    /// Call from the maintenance loop.
    pub fn age_queues(&self) {
        let mut inner = self.inner.lock();
        for level in (1..=4).rev() {
            let threshold = Duration::from_millis(self.config.aging_threshold_ms[level]);
            if threshold.is_zero() {
                continue;
            }
            let mut promoted: Vec<Ticket> = Vec::new();
            let queue = &mut inner.queues[level];
            let mut i = 0;
            while i < queue.len() {
                if queue[i].enqueued_at.elapsed() > threshold {
                    if let Some(ticket) = queue.remove(i) {
                        promoted.push(ticket);
                        continue;
                    }
                }
                i += 1;
            }
            if !promoted.is_empty() {
                inner.counters.aging_bumps += promoted.len() as u64;
                AGING_BUMPS.inc_by(promoted.len() as f64);
                debug!(
                    from = %Priority::from_index(level),
                    count = promoted.len(),
                    "Aged requests one level up"
                );
                for ticket in promoted {
                    inner.queues[level - 1].push_back(ticket);
                }
            }
        }
        drop(inner);
        self.dispatch();
    }

    /// Spawn the aging loop.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                scheduler.age_queues();
            }
        })
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock();
        let counters = &inner.counters;
        let avg_preemption_duration_ms = if counters.total_preemptions == 0 {
            0.0
        } else {
            counters.preemption_wait_total.as_secs_f64() * 1000.0
                / counters.total_preemptions as f64
        };
        let queue_depths = std::array::from_fn(|i| inner.queues[i].len());
        let stats_base = SchedulerStats {
            queue_depths,
            active: inner.active,
            aging_bumps: counters.aging_bumps,
            fairness_interventions: counters.fairness_interventions,
            total_preemptions: counters.total_preemptions,
            preemptions_by_priority: counters.preemptions_by_priority,
            avg_preemption_duration_ms,
            sla_violations: counters.sla_violations,
            throughput_by_priority: counters.dispatched,
            max_wait_by_priority_ms: std::array::from_fn(|i| {
                counters.max_wait[i].as_millis() as u64
            }),
            wait_percentiles_ms: [(0.0, 0.0, 0.0); 5],
        };
        drop(inner);

        let mut digests = self.wait_digests.lock();
        let wait_percentiles_ms = std::array::from_fn(|i| {
            let d = &mut digests[i];
            (d.percentile(0.5), d.percentile(0.95), d.percentile(0.99))
        });
        SchedulerStats {
            wait_percentiles_ms,
            ..stats_base
        }
    }

    /// Cancel every queued ticket (shutdown).
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        for queue in &mut inner.queues {
            queue.clear();
        }
        for priority in Priority::ALL {
            QUEUE_DEPTH.with_label_values(&[&priority.to_string()]).set(0.0);
        }
    }

    /// Fill free window slots from the queues.
    fn dispatch(&self) {
        loop {
            let dispatched = {
                let mut inner = self.inner.lock();
                if inner.active >= self.config.max_concurrent {
                    return;
                }

                let level = self.pick_level(&mut inner);
                let Some(level) = level else { return };
                let Some(ticket) = inner.queues[level].pop_front() else {
                    continue;
                };
                QUEUE_DEPTH
                    .with_label_values(&[&Priority::from_index(level).to_string()])
                    .set(inner.queues[level].len() as f64);

                let wait = ticket.enqueued_at.elapsed();
                let original = ticket.original;
                let orig_idx = original.index();
                inner.counters.max_wait[orig_idx] =
                    inner.counters.max_wait[orig_idx].max(wait);
                if let Some(displaced_at) = ticket.displaced_at {
                    inner.counters.preemption_wait_total += displaced_at.elapsed();
                }

                // Deadline check at dispatch time.
                let mut violated = None;
                if let Some(deadline) = ticket.deadline {
                    let now = Instant::now();
                    if now > deadline {
                        let overage = now - deadline;
                        inner.counters.sla_violations[orig_idx] += 1;
                        SLA_VIOLATIONS
                            .with_label_values(&[&original.to_string()])
                            .inc();
                        violated = Some(overage);
                    }
                }
                let outcome = match violated {
                    Some(overage) if self.config.drop_expired => {
                        DispatchOutcome::DroppedExpired { overage }
                    }
                    _ => DispatchOutcome::Run {
                        effective: Priority::from_index(level),
                        sla_overage: violated,
                    },
                };

                let run = matches!(outcome, DispatchOutcome::Run { .. });
                let accepted = ticket.go.send(outcome).is_ok();
                if accepted && run {
                    inner.active += 1;
                    inner.counters.dispatched[orig_idx] += 1;
                }
                (original, wait, violated)
            };

            let (original, wait, violated) = dispatched;
            let wait_ms = wait.as_secs_f64() * 1000.0;
            WAIT_MS
                .with_label_values(&[&original.to_string()])
                .observe(wait_ms);
            self.wait_digests.lock()[original.index()].add(wait_ms);
            if let Some(overage) = violated {
                warn!(
                    priority = %original,
                    overage_ms = overage.as_millis() as u64,
                    "SLA deadline violated"
                );
            }
        }
    }

    /// Pick the next level: normally the highest non-empty, with a
    /// fairness fraction forced to the lowest non-empty.
    fn pick_level(&self, inner: &mut SchedulerInner) -> Option<usize> {
        let non_empty: Vec<usize> = (0..5).filter(|i| !inner.queues[*i].is_empty()).collect();
        let (first, last) = (non_empty.first()?, non_empty.last()?);
        if first != last && rand::thread_rng().gen::<f64>() < self.config.fairness_ratio {
            inner.counters.fairness_interventions += 1;
            FAIRNESS.inc();
            return Some(*last);
        }
        Some(*first)
    }

    fn release(&self) {
        {
            let mut inner = self.inner.lock();
            inner.active = inner.active.saturating_sub(1);
        }
        self.dispatch();
    }
}

impl Drop for SchedulerPermit {
    fn drop(&mut self) {
        self.scheduler.release();
    }
}
