use crate::{
    instance::{HealthChange, Instance, InstanceId, InstanceState, InstanceStat},
    model::Batch,
    request::{CorrelationId, Pending, RequestId},
};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// A batch handed to an instance.
#[derive(Debug, Clone)]
pub(crate) struct Dispatched {
    pub instance: InstanceId,
    pub batch_id: u64,
    pub rows: usize,
    pub requests: Vec<(RequestId, Option<CorrelationId>, Instant)>,
}

/// Owns the instance pool of one model and the batches waiting for it.
pub(crate) struct Dispatcher {
    instances: Vec<Instance>,
    ready: VecDeque<Batch>,
    lost: Vec<InstanceId>,
}

impl Dispatcher {
    pub fn new(instances: Vec<Instance>) -> Self {
        Dispatcher {
            instances,
            ready: VecDeque::new(),
            lost: vec![],
        }
    }

    /// Instances that may receive batches and new sequences.
    pub fn accepting(&self) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|instance| instance.is_accepting())
            .map(Instance::id)
            .collect()
    }

    pub fn is_servable(&self) -> bool {
        self.instances.iter().any(Instance::is_accepting)
    }

    /// Every instance released, or never loaded.
    pub fn all_removed(&self) -> bool {
        self.instances.iter().all(|instance| {
            matches!(
                instance.state(),
                InstanceState::Removed | InstanceState::LoadFailed
            )
        })
    }

    pub fn push_ready(&mut self, batch: Batch) {
        self.ready.push_back(batch);
    }

    pub fn ready_batches(&self) -> usize {
        self.ready.len()
    }

    pub fn ready_requests(&self) -> usize {
        self.ready.iter().map(Batch::len).sum()
    }

    /// An idle instance exists that no untargeted ready batch will take.
    pub fn has_unclaimed_idle(&self) -> bool {
        let idle = self.instances.iter().filter(|i| i.is_idle()).count();
        let claimed = self.ready.iter().filter(|b| b.target().is_none()).count();
        idle > claimed
    }

    /// `instance` is idle and no ready batch waits for it.
    pub fn is_unclaimed_idle(&self, instance: InstanceId) -> bool {
        self.instances.get(instance).map_or(false, Instance::is_idle)
            && !self.ready.iter().any(|b| b.target() == Some(instance))
    }

    /// Bind ready batches to idle instances in assembly order. Untargeted
    /// batches go to the idle instance with the fewest completed batches,
    /// ties broken by creation order; sequence batches wait for their target.
    pub fn dispatch(&mut self) -> Vec<Dispatched> {
        let mut dispatched = vec![];
        let mut waiting = VecDeque::new();
        while let Some(batch) = self.ready.pop_front() {
            let choice = match batch.target() {
                Some(target) => self
                    .instances
                    .get(target)
                    .filter(|instance| instance.is_idle())
                    .map(Instance::id),
                None => self
                    .instances
                    .iter()
                    .filter(|instance| instance.is_idle())
                    .min_by_key(|instance| (instance.completed_batches(), instance.id()))
                    .map(Instance::id),
            };
            let id = match choice {
                Some(id) => id,
                None => {
                    waiting.push_back(batch);
                    continue;
                }
            };
            let summary = Dispatched {
                instance: id,
                batch_id: batch.id(),
                rows: batch.rows(),
                requests: batch
                    .pending()
                    .iter()
                    .map(|p| (p.id, p.correlation_id(), p.arrive_time))
                    .collect(),
            };
            let instance = &mut self.instances[id];
            match instance.start(batch) {
                Ok(()) => {
                    log::debug!(
                        "batch {} ({} rows) -> instance {} on {}",
                        summary.batch_id,
                        summary.rows,
                        id,
                        instance.device()
                    );
                    dispatched.push(summary);
                }
                Err(batch) => {
                    log::error!("instance {} lost its worker, removing it", id);
                    instance.remove();
                    self.lost.push(id);
                    waiting.push_back(batch);
                }
            }
        }
        self.ready = waiting;
        dispatched
    }

    /// Instances removed by `dispatch` since the last call, together with the
    /// ready batches no remaining instance can run.
    pub fn take_lost(&mut self) -> (Vec<InstanceId>, Vec<Batch>) {
        let lost = std::mem::take(&mut self.lost);
        if lost.is_empty() {
            return (lost, vec![]);
        }
        let servable = self.is_servable();
        let instances = &self.instances;
        let (stranded, ready): (VecDeque<Batch>, VecDeque<Batch>) =
            self.ready.drain(..).partition(|batch| match batch.target() {
                Some(target) => !instances.get(target).map_or(false, Instance::is_accepting),
                None => !servable,
            });
        self.ready = ready;
        (lost, stranded.into_iter().collect())
    }

    /// Batch finished on `instance`. A draining instance is removed afterwards.
    pub fn finish(
        &mut self,
        instance: InstanceId,
        failed: bool,
        elapsed: Duration,
        unhealthy_threshold: usize,
    ) -> Option<HealthChange> {
        let instance = self.instances.get_mut(instance)?;
        let change = instance.finish(failed, elapsed, unhealthy_threshold);
        if instance.state() == InstanceState::Draining {
            log::info!("instance {} drained", instance.id());
            instance.remove();
        }
        change
    }

    /// Stop every instance once its current batch is done.
    pub fn drain(&mut self) {
        assert!(self.ready.is_empty(), "draining with ready batches");
        for instance in &mut self.instances {
            instance.drain();
        }
    }

    /// Remove a member of a ready batch for cancellation.
    pub fn remove(&mut self, id: RequestId) -> Option<Pending> {
        let index = self
            .ready
            .iter()
            .position(|batch| batch.pending().iter().any(|p| p.id == id))?;
        let pending = self.ready[index].remove(id);
        if self.ready[index].is_empty() {
            self.ready.remove(index);
        }
        pending
    }

    pub fn stats(&self) -> Vec<InstanceStat> {
        self.instances.iter().map(Instance::stat).collect()
    }
}
