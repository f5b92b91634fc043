//! Builder for Orchestrator, caller should provide model configs and backends
use crate::{
    config::{Device, ModelConfig},
    error::Result,
    instance::HealthEvent,
    model::{Inference, ModelFactory},
    orchestrator::Orchestrator,
};
use crossbeam::channel;
use std::sync::Arc;

/// Builder for the orchestrator
#[derive(Default)]
pub struct Builder {
    health_listener: Option<channel::Sender<HealthEvent>>,
    model_infos: Vec<ModelInfo>,
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Builder::default()
    }

    config!(
        health_listener,
        Option<channel::Sender<HealthEvent>>,
        "Receives instance health events of every model"
    );

    /// model register
    pub fn register_model(mut self, info: ModelInfo) -> Self {
        self.model_infos.push(info);
        self
    }

    /// Build the service, loading every registered model
    pub fn build(self) -> Result<Orchestrator> {
        let orchestrator = Orchestrator::new(self.health_listener);
        for info in self.model_infos {
            orchestrator.load_model(info.config, info.factory)?;
        }
        Ok(orchestrator)
    }
}

/// register model info
pub struct ModelInfo {
    config: ModelConfig,
    factory: ModelFactory,
}

impl ModelInfo {
    /// create ModelInfo from a shared factory
    pub fn new(config: ModelConfig, factory: ModelFactory) -> Self {
        ModelInfo { config, factory }
    }

    /// create ModelInfo from a closure building one backend per instance
    pub fn with_factory<F>(config: ModelConfig, factory: F) -> Self
    where
        F: 'static + Fn(&Device) -> std::result::Result<Box<dyn Inference>, String> + Send + Sync,
    {
        ModelInfo::new(config, Arc::new(factory))
    }
}
