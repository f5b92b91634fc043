#![warn(missing_docs)]
#![warn(clippy::all)]

//! Orchestrator schedules inference requests for all loaded models:
//! dynamic batching, sequence routing for stateful models and dispatch to
//! model instances.

#[macro_use]
pub mod config;

pub(crate) mod batcher;
pub mod builder;
pub(crate) mod dispatcher;
pub mod error;
pub(crate) mod executor;
pub mod instance;
pub mod model;
pub mod orchestrator;
pub(crate) mod queue;
pub mod request;
pub mod scheduler;
pub(crate) mod sequence;
pub mod stats;

pub use crate::orchestrator::{ModelStatus, Orchestrator};
pub use builder::{Builder, ModelInfo};
pub use config::{
    Device, DynamicBatching, InstanceGroup, ModelConfig, Scheduling, SequenceBatching,
    TimeoutPolicy,
};
pub use error::{Error, Result};
pub use instance::{HealthEvent, InstanceId, InstanceState, InstanceStat};
pub use model::{Batch, BatchOutput, Inference, ModelFactory};
pub use request::{
    Canceller, CorrelationId, InferRequest, InferResponse, RequestId, Response, SequenceControl,
    Tensor, Ticket,
};
pub use scheduler::{Drain, Scheduler};
pub use stats::{LatencyStat, Stats};
