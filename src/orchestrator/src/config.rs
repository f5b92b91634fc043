//! Per-model scheduling configuration.
use crate::error::{Error, Result};
use std::{fmt, time::Duration};

macro_rules! config {
    ($name:ident, $t: ty, $comment: literal) => {
        #[doc=$comment]
        pub fn $name(mut self, $name: $t) -> Self {
            self.$name = $name;
            self
        }
    };
}

/// Device an instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host CPU
    Cpu,
    /// GPU by device id
    Gpu(i32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu{}", id),
        }
    }
}

/// `count` instances placed on `device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceGroup {
    /// Number of instances
    pub count: usize,
    /// Device binding of every instance in the group
    pub device: Device,
}

impl InstanceGroup {
    /// Create an instance group
    pub fn new(count: usize, device: Device) -> Self {
        InstanceGroup { count, device }
    }
}

/// Knobs of the dynamic batch assembler.
///
/// `max_queue_delay` of zero means "cut whatever is queued as soon as an
/// instance is idle". `min_batch_size` enables that idle trigger for non-zero
/// delays once at least that many rows are queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicBatching {
    /// Batch sizes the backend runs best at
    pub preferred_batch_sizes: Vec<usize>,
    /// Upper bound on the time a request waits to be batched
    pub max_queue_delay: Duration,
    /// Rows needed to cut early when an instance is idle
    pub min_batch_size: Option<usize>,
}

impl Default for DynamicBatching {
    fn default() -> Self {
        DynamicBatching {
            preferred_batch_sizes: vec![],
            max_queue_delay: Duration::new(0, 0),
            min_batch_size: None,
        }
    }
}

impl DynamicBatching {
    /// Dynamic batching with default knobs
    pub fn new() -> Self {
        DynamicBatching::default()
    }

    config!(
        preferred_batch_sizes,
        Vec<usize>,
        "Batch sizes preferred by the assembler"
    );
    config!(max_queue_delay, Duration, "Maximum batching delay");
    config!(
        min_batch_size,
        Option<usize>,
        "Rows needed to cut a batch for an idle instance"
    );
}

/// What happens to requests of a sequence that hit its idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Reject them with `SequenceTimeout`
    Fail,
    /// Treat the next request as the start of a new sequence
    Restart,
}

/// Stateful models: sequence routing plus per-instance batching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceBatching {
    /// A sequence with no pending work for this long is forcibly ended
    pub idle_timeout: Duration,
    /// Behaviour for late requests of a timed-out sequence
    pub timeout_policy: TimeoutPolicy,
    /// Assembly triggers applied to sequence heads of one instance
    pub batching: DynamicBatching,
}

impl Default for SequenceBatching {
    fn default() -> Self {
        SequenceBatching {
            idle_timeout: Duration::from_secs(1),
            timeout_policy: TimeoutPolicy::Fail,
            batching: DynamicBatching::default(),
        }
    }
}

impl SequenceBatching {
    /// Sequence batching with default knobs
    pub fn new() -> Self {
        SequenceBatching::default()
    }

    config!(idle_timeout, Duration, "Sequence idle timeout");
    config!(timeout_policy, TimeoutPolicy, "Late request policy");
    config!(batching, DynamicBatching, "Per-instance batching triggers");
}

/// Batch assembly policy of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduling {
    /// One request per batch
    Direct,
    /// Dynamic batching of independent requests
    Dynamic(DynamicBatching),
    /// Sequence batching for stateful models
    Sequence(SequenceBatching),
}

/// Everything the scheduler needs to serve one model version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Model name
    pub name: String,
    /// Model version
    pub version: u64,
    /// Hard cap on rows per batch
    pub max_batch_size: usize,
    /// Instances to create on load
    pub instance_groups: Vec<InstanceGroup>,
    /// Assembly policy
    pub scheduling: Scheduling,
    /// Reject enqueues once this many requests wait
    pub max_queue_size: Option<usize>,
    /// Consecutive failed batches before an instance is reported unhealthy
    pub unhealthy_threshold: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            name: String::new(),
            version: 1,
            max_batch_size: 1,
            instance_groups: vec![InstanceGroup::new(1, Device::Cpu)],
            scheduling: Scheduling::Direct,
            max_queue_size: None,
            unhealthy_threshold: 3,
        }
    }
}

impl ModelConfig {
    /// Config for `name` with default settings
    pub fn new(name: &str) -> Self {
        ModelConfig {
            name: name.to_string(),
            ..ModelConfig::default()
        }
    }

    config!(version, u64, "Model version");
    config!(max_batch_size, usize, "Maximum rows per batch");
    config!(instance_groups, Vec<InstanceGroup>, "Instance placement");
    config!(scheduling, Scheduling, "Batch assembly policy");
    config!(max_queue_size, Option<usize>, "Queue capacity");
    config!(
        unhealthy_threshold,
        usize,
        "Failures before an instance is reported unhealthy, 0 disables"
    );

    /// `name:version`, used in logs and errors.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    /// Devices of all instances, in creation order.
    pub fn devices(&self) -> Vec<Device> {
        self.instance_groups
            .iter()
            .flat_map(|group| std::iter::repeat(group.device).take(group.count))
            .collect()
    }

    /// Assembly triggers, `None` for direct scheduling.
    pub fn batching(&self) -> Option<&DynamicBatching> {
        match &self.scheduling {
            Scheduling::Direct => None,
            Scheduling::Dynamic(batching) => Some(batching),
            Scheduling::Sequence(sequence) => Some(&sequence.batching),
        }
    }

    /// Sequence settings for stateful models.
    pub fn sequence(&self) -> Option<&SequenceBatching> {
        match &self.scheduling {
            Scheduling::Sequence(sequence) => Some(sequence),
            _ => None,
        }
    }

    /// Reject settings the scheduler cannot honour.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidConfig(reason));
        if self.name.is_empty() {
            return invalid("model name is empty".to_string());
        }
        if self.max_batch_size == 0 {
            return invalid(format!("{}: max_batch_size must be positive", self.key()));
        }
        if self.devices().is_empty() {
            return invalid(format!("{}: no instances configured", self.key()));
        }
        if self.max_queue_size == Some(0) {
            return invalid(format!("{}: max_queue_size must be positive", self.key()));
        }
        if let Some(batching) = self.batching() {
            for &size in &batching.preferred_batch_sizes {
                if size == 0 || size > self.max_batch_size {
                    return invalid(format!(
                        "{}: preferred batch size {} outside 1..={}",
                        self.key(),
                        size,
                        self.max_batch_size
                    ));
                }
            }
            if batching.min_batch_size == Some(0) {
                return invalid(format!("{}: min_batch_size must be positive", self.key()));
            }
        }
        if let Some(sequence) = self.sequence() {
            if sequence.idle_timeout == Duration::new(0, 0) {
                return invalid(format!("{}: sequence idle timeout is zero", self.key()));
            }
        }
        Ok(())
    }
}
