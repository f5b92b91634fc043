//! Model instance state machine.
use crate::{config::Device, executor::Executor, model::Batch};
use std::time::{Duration, Instant};

/// Index of an instance within its model, in creation order.
pub type InstanceId = usize;

/// Lifecycle of a model instance.
///
/// `Loading → Idle ↔ Executing → … → Draining → Removed`, or `LoadFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Backend is being initialized
    Loading,
    /// Ready for a batch
    Idle,
    /// Running a batch
    Executing,
    /// Finishing its last batch before removal
    Draining,
    /// Released
    Removed,
    /// Initialization failed; never receives batches
    LoadFailed,
}

/// Signals about instance health, sent to the model manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// The backend could not be initialized
    LoadFailed {
        /// `name:version`
        model: String,
        /// Instance id
        instance: InstanceId,
        /// Backend's error
        reason: String,
    },
    /// Consecutive batch failures reached the configured threshold
    Unhealthy {
        /// `name:version`
        model: String,
        /// Instance id
        instance: InstanceId,
        /// Failed batches in a row
        consecutive_failures: usize,
    },
    /// A previously unhealthy instance completed a batch
    Recovered {
        /// `name:version`
        model: String,
        /// Instance id
        instance: InstanceId,
    },
}

/// Health change caused by one completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HealthChange {
    Unhealthy(usize),
    Recovered,
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStat {
    /// Instance id
    pub id: InstanceId,
    /// Device binding
    pub device: Device,
    /// Current state
    pub state: InstanceState,
    /// Batches executed, failed ones included
    pub completed_batches: u64,
    /// Batches the backend failed as a whole
    pub failed_batches: u64,
    /// Total time spent executing
    pub busy_time: Duration,
    /// busy_time over lifetime
    pub utilization: f64,
}

pub(crate) struct Instance {
    id: InstanceId,
    device: Device,
    state: InstanceState,
    created: Instant,
    completed_batches: u64,
    failed_batches: u64,
    consecutive_failures: usize,
    busy_time: Duration,
    executor: Option<Executor>,
}

impl Instance {
    pub fn new(id: InstanceId, device: Device, executor: Executor) -> Self {
        Instance {
            id,
            device,
            state: InstanceState::Loading,
            created: Instant::now(),
            completed_batches: 0,
            failed_batches: 0,
            consecutive_failures: 0,
            busy_time: Duration::new(0, 0),
            executor: Some(executor),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn completed_batches(&self) -> u64 {
        self.completed_batches
    }

    pub fn is_idle(&self) -> bool {
        self.state == InstanceState::Idle
    }

    /// Idle or executing: may receive sequences and batches.
    pub fn is_accepting(&self) -> bool {
        matches!(self.state, InstanceState::Idle | InstanceState::Executing)
    }

    pub fn loaded(&mut self, result: Result<(), String>) {
        assert_eq!(self.state, InstanceState::Loading, "instance {}", self.id);
        match result {
            Ok(()) => self.state = InstanceState::Idle,
            Err(_) => {
                self.state = InstanceState::LoadFailed;
                // the worker exits on its own after a failed load
                if let Some(executor) = self.executor.take() {
                    executor.shutdown();
                }
            }
        }
    }

    /// Bind a batch. Only idle instances may be started.
    pub fn start(&mut self, batch: Batch) -> Result<(), Batch> {
        assert!(self.is_idle(), "instance {} is {:?}", self.id, self.state);
        let executor = match &self.executor {
            Some(executor) => executor,
            None => return Err(batch),
        };
        executor.run(batch)?;
        self.state = InstanceState::Executing;
        Ok(())
    }

    /// Batch finished; returns a health change worth reporting.
    pub fn finish(
        &mut self,
        failed: bool,
        elapsed: Duration,
        unhealthy_threshold: usize,
    ) -> Option<HealthChange> {
        assert!(
            matches!(self.state, InstanceState::Executing | InstanceState::Draining),
            "instance {} finished while {:?}",
            self.id,
            self.state
        );
        self.completed_batches += 1;
        self.busy_time += elapsed;
        if self.state == InstanceState::Executing {
            self.state = InstanceState::Idle;
        }
        let was_unhealthy =
            unhealthy_threshold > 0 && self.consecutive_failures >= unhealthy_threshold;
        if failed {
            self.failed_batches += 1;
            self.consecutive_failures += 1;
            if unhealthy_threshold > 0 && self.consecutive_failures == unhealthy_threshold {
                return Some(HealthChange::Unhealthy(self.consecutive_failures));
            }
            return None;
        }
        self.consecutive_failures = 0;
        if was_unhealthy {
            Some(HealthChange::Recovered)
        } else {
            None
        }
    }

    /// Stop taking batches: idle instances are removed at once, executing
    /// ones finish their batch first.
    pub fn drain(&mut self) {
        match self.state {
            InstanceState::Idle | InstanceState::Loading => self.remove(),
            InstanceState::Executing => self.state = InstanceState::Draining,
            InstanceState::Draining | InstanceState::Removed | InstanceState::LoadFailed => {}
        }
    }

    /// Removal after the last batch of a draining instance.
    pub fn remove(&mut self) {
        if let Some(executor) = self.executor.take() {
            executor.shutdown();
        }
        if self.state != InstanceState::LoadFailed {
            self.state = InstanceState::Removed;
        }
    }

    pub fn stat(&self) -> InstanceStat {
        let lifetime = self.created.elapsed().as_secs_f64();
        let utilization = if lifetime > 0.0 {
            (self.busy_time.as_secs_f64() / lifetime).min(1.0)
        } else {
            0.0
        };
        InstanceStat {
            id: self.id,
            device: self.device,
            state: self.state,
            completed_batches: self.completed_batches,
            failed_batches: self.failed_batches,
            busy_time: self.busy_time,
            utilization,
        }
    }
}
