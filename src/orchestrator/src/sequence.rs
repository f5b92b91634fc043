//! Sequence routing for stateful models.
//!
//! Every correlation id goes `Unseen → Active → Ended`. An active sequence is
//! pinned to one instance and its steps wait in their own FIFO; only the head
//! step of a sequence can join a batch, so steps never overtake each other and
//! a batch never holds two steps of one sequence.
use crate::{
    batcher::Candidates,
    config::{SequenceBatching, TimeoutPolicy},
    error::{Error, Result},
    instance::InstanceId,
    request::{CorrelationId, Pending, RequestId, SequenceRef},
};
use std::{
    cmp::Reverse,
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// How many timed-out correlation ids are remembered for `SequenceTimeout`.
const TIMED_OUT_MEMORY: usize = 4096;

struct Sequence {
    generation: u64,
    instance: InstanceId,
    steps: VecDeque<Pending>,
    next_step: u64,
    in_flight: usize,
    ending: bool,
    last_activity: Instant,
}

impl Sequence {
    fn is_idle(&self) -> bool {
        self.steps.is_empty() && self.in_flight == 0
    }
}

pub(crate) struct SequenceTracker {
    sequences: HashMap<CorrelationId, Sequence>,
    timed_out: VecDeque<CorrelationId>,
    idle_timeout: Duration,
    policy: TimeoutPolicy,
    queued: usize,
    next_generation: u64,
}

fn conflict(correlation_id: CorrelationId, reason: &str) -> Error {
    Error::SequenceConflict {
        correlation_id,
        reason: reason.to_string(),
    }
}

impl SequenceTracker {
    pub fn new(config: &SequenceBatching) -> Self {
        SequenceTracker {
            sequences: HashMap::new(),
            timed_out: VecDeque::new(),
            idle_timeout: config.idle_timeout,
            policy: config.timeout_policy,
            queued: 0,
            next_generation: 0,
        }
    }

    /// Active sequences.
    pub fn active(&self) -> usize {
        self.sequences.len()
    }

    /// Steps waiting to be batched.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Instance a sequence is pinned to.
    #[cfg(test)]
    pub fn instance_of(&self, correlation_id: CorrelationId) -> Option<InstanceId> {
        self.sequences.get(&correlation_id).map(|seq| seq.instance)
    }

    /// Route one step. `accepting` lists the instances that may take new
    /// sequences, in creation order.
    pub fn admit(
        &mut self,
        mut pending: Pending,
        accepting: &[InstanceId],
        now: Instant,
    ) -> Result<()> {
        let control = match pending.request.sequence_control() {
            Some(control) => control,
            None => {
                return Err(Error::InvalidRequest(
                    "sequence batching requires a correlation id".to_string(),
                ))
            }
        };
        let id = control.correlation_id;
        if !self.sequences.contains_key(&id) {
            let timed_out = self.timed_out.contains(&id);
            if !control.start {
                if !timed_out {
                    return Err(conflict(id, "sequence not started"));
                }
                if self.policy == TimeoutPolicy::Fail {
                    return Err(Error::SequenceTimeout(id));
                }
                log::debug!("restarting timed out sequence {}", id);
            }
            let instance = self.least_loaded(accepting).ok_or_else(|| {
                Error::ModelUnavailable(format!("no instance accepts sequence {}", id))
            })?;
            self.timed_out.retain(|&timed_out| timed_out != id);
            let generation = self.next_generation;
            self.next_generation += 1;
            self.sequences.insert(
                id,
                Sequence {
                    generation,
                    instance,
                    steps: VecDeque::new(),
                    next_step: 0,
                    in_flight: 0,
                    ending: false,
                    last_activity: now,
                },
            );
        } else if control.start {
            return Err(conflict(id, "sequence already active"));
        }
        let seq = match self.sequences.get_mut(&id) {
            Some(seq) => seq,
            None => return Err(conflict(id, "sequence not started")),
        };
        if seq.ending {
            return Err(conflict(id, "sequence is ending"));
        }
        pending.step = Some(seq.next_step);
        pending.generation = seq.generation;
        seq.next_step += 1;
        seq.ending = control.end;
        seq.last_activity = now;
        seq.steps.push_back(pending);
        self.queued += 1;
        Ok(())
    }

    /// Fewest active sequences, then fewest pending steps, then creation order.
    fn least_loaded(&self, accepting: &[InstanceId]) -> Option<InstanceId> {
        accepting.iter().copied().min_by_key(|&instance| {
            let mut sequences = 0;
            let mut steps = 0;
            for seq in self.sequences.values().filter(|seq| seq.instance == instance) {
                sequences += 1;
                steps += seq.steps.len() + seq.in_flight;
            }
            (sequences, steps, instance)
        })
    }

    // head steps pinned to `instance`, in batch order
    fn heads(
        &self,
        instance: InstanceId,
        overdue: Option<Instant>,
    ) -> Vec<(CorrelationId, usize)> {
        let mut heads: Vec<_> = self
            .sequences
            .iter()
            .filter(|(_, seq)| seq.instance == instance)
            .filter_map(|(&id, seq)| seq.steps.front().map(|head| (id, head)))
            .map(|(id, head)| {
                let late = overdue.map_or(false, |cutoff| head.arrive_time <= cutoff);
                ((!late, Reverse(head.priority()), head.arrive_time, id), head.rows())
            })
            .collect();
        heads.sort_by_key(|(key, _)| *key);
        heads.into_iter().map(|(key, rows)| (key.3, rows)).collect()
    }

    /// What the assembler sees for one instance.
    pub fn candidates(&self, instance: InstanceId) -> Option<Candidates> {
        let heads = self.heads(instance, None);
        let front_rows = heads.first()?.1;
        let rows = heads.iter().map(|(_, rows)| rows).sum();
        let oldest_arrival = heads
            .iter()
            .filter_map(|(id, _)| self.sequences.get(id)?.steps.front())
            .map(|head| head.arrive_time)
            .min()?;
        Some(Candidates {
            rows,
            front_rows,
            oldest_arrival,
        })
    }

    /// Pop at most one head step per sequence pinned to `instance`.
    /// Sequences whose end step is popped are ended.
    pub fn pop_batch(
        &mut self,
        instance: InstanceId,
        max_rows: usize,
        overdue: Option<Instant>,
        now: Instant,
    ) -> Vec<Pending> {
        let mut batch = vec![];
        let mut rows = 0;
        for (id, head_rows) in self.heads(instance, overdue) {
            if !batch.is_empty() && rows + head_rows > max_rows {
                break;
            }
            let seq = match self.sequences.get_mut(&id) {
                Some(seq) => seq,
                None => continue,
            };
            if let Some(step) = seq.steps.pop_front() {
                rows += step.rows();
                seq.in_flight += 1;
                seq.last_activity = now;
                self.queued -= 1;
                if step.is_sequence_end() {
                    log::debug!("sequence {} ended on instance {}", id, instance);
                    self.sequences.remove(&id);
                }
                batch.push(step);
            }
        }
        batch
    }

    /// A popped step completed or was dropped. Steps of an earlier sequence
    /// under the same correlation id are ignored.
    pub fn finished(&mut self, (correlation_id, generation): SequenceRef, now: Instant) {
        match self.sequences.get_mut(&correlation_id) {
            Some(seq) if seq.generation == generation => {
                seq.in_flight = seq.in_flight.saturating_sub(1);
                seq.last_activity = now;
            }
            _ => {}
        }
    }

    /// Force-end sequences idle for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<CorrelationId> {
        let idle_timeout = self.idle_timeout;
        let expired: Vec<CorrelationId> = self
            .sequences
            .iter()
            .filter(|(_, seq)| seq.is_idle() && now >= seq.last_activity + idle_timeout)
            .map(|(&id, _)| id)
            .collect();
        for &id in &expired {
            self.sequences.remove(&id);
            if self.timed_out.len() == TIMED_OUT_MEMORY {
                self.timed_out.pop_front();
            }
            self.timed_out.push_back(id);
        }
        expired
    }

    /// Next idle timeout, if any sequence is idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sequences
            .values()
            .filter(|seq| seq.is_idle())
            .map(|seq| seq.last_activity + self.idle_timeout)
            .min()
    }

    /// Remove a queued step for cancellation.
    pub fn remove(&mut self, id: RequestId) -> Option<Pending> {
        for seq in self.sequences.values_mut() {
            if let Some(index) = seq.steps.iter().position(|step| step.id == id) {
                let step = seq.steps.remove(index)?;
                if step.is_sequence_end() {
                    seq.ending = false;
                }
                self.queued -= 1;
                return Some(step);
            }
        }
        None
    }

    /// End every sequence pinned to a lost instance; their queued steps are
    /// returned to be failed.
    pub fn release_instance(&mut self, instance: InstanceId) -> Vec<Pending> {
        let lost: Vec<CorrelationId> = self
            .sequences
            .iter()
            .filter(|(_, seq)| seq.instance == instance)
            .map(|(&id, _)| id)
            .collect();
        let mut steps = vec![];
        for id in lost {
            if let Some(seq) = self.sequences.remove(&id) {
                log::warn!("sequence {} lost instance {}", id, instance);
                self.queued -= seq.steps.len();
                steps.extend(seq.steps);
            }
        }
        steps
    }

    /// Release every idle sequence, used when the model drains.
    pub fn end_idle(&mut self) -> usize {
        let before = self.sequences.len();
        self.sequences.retain(|_, seq| !seq.is_idle());
        before - self.sequences.len()
    }
}
