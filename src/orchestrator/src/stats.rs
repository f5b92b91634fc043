//! Scheduler statistics, read by telemetry exporters.
use crate::instance::InstanceStat;
use std::{collections::BTreeMap, time::Duration};

/// Queueing latency: time from arrival to dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStat {
    /// Requests measured
    pub count: u64,
    /// Sum of all latencies
    pub total: Duration,
    /// Worst latency seen
    pub max: Duration,
}

impl LatencyStat {
    pub(crate) fn record(&mut self, latency: Duration) {
        self.count += 1;
        self.total += latency;
        self.max = self.max.max(latency);
    }

    /// Average latency, if anything was measured
    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            self.total.as_secs_f64() / self.count as f64,
        ))
    }
}

/// Counters accumulated by one scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Counters {
    pub batch_sizes: BTreeMap<usize, u64>,
    pub queue_latency: LatencyStat,
    pub completed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub expired: u64,
}

impl Counters {
    pub fn record_batch(&mut self, rows: usize) {
        *self.batch_sizes.entry(rows).or_insert(0) += 1;
    }
}

/// Point-in-time view of one model's scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    /// `name:version`
    pub model: String,
    /// Whether new requests are accepted
    pub servable: bool,
    /// Requests waiting to be batched
    pub queue_depth: usize,
    /// Batches cut but not yet dispatched
    pub ready_batches: usize,
    /// Requests executing
    pub in_flight: usize,
    /// Sequences pinned to an instance
    pub active_sequences: usize,
    /// Executed batches by row count
    pub batch_sizes: BTreeMap<usize, u64>,
    /// Arrival to dispatch
    pub queue_latency: LatencyStat,
    /// Requests whose batch finished
    pub completed_requests: u64,
    /// Requests refused at enqueue
    pub rejected_requests: u64,
    /// Requests cancelled before dispatch
    pub cancelled_requests: u64,
    /// Requests dropped for a missed deadline
    pub expired_requests: u64,
    /// Per-instance state and utilization
    pub instances: Vec<InstanceStat>,
}
