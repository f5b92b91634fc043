use crate::config::DynamicBatching;
use std::time::{Duration, Instant};

/// What the assembler wants to do with the current candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Cut a batch of at most this many rows. `overdue` carries the arrival
    /// cutoff when the delay bound forced the cut.
    Cut {
        max_rows: usize,
        overdue: Option<Instant>,
    },
    /// Keep waiting; re-evaluate at the deadline or on the next event.
    Wait(Option<Instant>),
}

/// Candidates the assembler decides on: a request queue, or the sequence
/// heads pinned to one instance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidates {
    pub rows: usize,
    pub front_rows: usize,
    pub oldest_arrival: Instant,
}

/// Turns queued requests into batch cuts.
pub(crate) struct Batcher {
    max_batch_size: usize,
    policy: Option<DynamicBatching>,
}

impl Batcher {
    /// `policy` is `None` for direct scheduling.
    pub fn new(max_batch_size: usize, policy: Option<DynamicBatching>) -> Self {
        let policy = policy.map(|mut policy| {
            policy.preferred_batch_sizes.sort_unstable();
            policy.preferred_batch_sizes.dedup();
            policy
        });
        Batcher {
            max_batch_size,
            policy,
        }
    }

    /// `idle` tells whether an instance is free to take the cut right away.
    pub fn decide(&self, candidates: Option<Candidates>, now: Instant, idle: bool) -> Decision {
        let candidates = match candidates {
            Some(candidates) => candidates,
            None => return Decision::Wait(None),
        };
        let policy = match &self.policy {
            // direct: a batch per request, only once someone can run it
            None if idle => {
                return Decision::Cut {
                    max_rows: candidates.front_rows,
                    overdue: None,
                }
            }
            None => return Decision::Wait(None),
            Some(policy) => policy,
        };
        let cut = Decision::Cut {
            max_rows: self.batch_size(candidates.rows),
            overdue: None,
        };
        if candidates.rows >= self.target_size() {
            return cut;
        }
        if policy.max_queue_delay == Duration::new(0, 0) {
            return if idle { cut } else { Decision::Wait(None) };
        }
        let deadline = candidates.oldest_arrival + policy.max_queue_delay;
        if now >= deadline {
            return Decision::Cut {
                max_rows: self.batch_size(candidates.rows),
                overdue: now.checked_sub(policy.max_queue_delay),
            };
        }
        if idle && policy.min_batch_size.map_or(false, |min| candidates.rows >= min) {
            return cut;
        }
        Decision::Wait(Some(deadline))
    }

    /// Rows at which a batch is cut without waiting.
    fn target_size(&self) -> usize {
        self.policy
            .as_ref()
            .and_then(|policy| policy.preferred_batch_sizes.last().copied())
            .unwrap_or(self.max_batch_size)
    }

    /// Largest preferred size not above `rows`, else `rows` capped at the max.
    pub fn batch_size(&self, rows: usize) -> usize {
        let preferred = self.policy.as_ref().and_then(|policy| {
            policy
                .preferred_batch_sizes
                .iter()
                .rev()
                .find(|&&size| size <= rows)
                .copied()
        });
        preferred.unwrap_or_else(|| rows.min(self.max_batch_size))
    }
}
