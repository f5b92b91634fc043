//! Orchestrator: the registry of loaded models and the entry point for
//! requests. Each model version runs its own [`Scheduler`], so models never
//! contend beyond a read lock on the registry.
use crate::{
    config::ModelConfig,
    error::{Error, Result},
    instance::HealthEvent,
    model::ModelFactory,
    request::{InferRequest, Ticket},
    scheduler::{Drain, Scheduler},
    stats::Stats,
};
use crossbeam::channel;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{PoisonError, RwLock},
};

/// Name, version and readiness of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStatus {
    /// Model name
    pub name: String,
    /// Model version
    pub version: u64,
    /// Accepting requests
    pub servable: bool,
}

/// Orchestrator
pub struct Orchestrator {
    models: RwLock<HashMap<String, BTreeMap<u64, Scheduler>>>,
    health: Option<channel::Sender<HealthEvent>>,
}

impl Orchestrator {
    pub(crate) fn new(health: Option<channel::Sender<HealthEvent>>) -> Self {
        Orchestrator {
            models: RwLock::new(HashMap::new()),
            health,
        }
    }

    /// Create the instances of a model version and start serving it.
    pub fn load_model(&self, config: ModelConfig, factory: ModelFactory) -> Result<()> {
        let key = config.key();
        if self.scheduler(&config.name, Some(config.version)).is_some() {
            return Err(Error::InvalidConfig(format!("{} is already loaded", key)));
        }
        let name = config.name.clone();
        let version = config.version;
        let scheduler = Scheduler::start(config, factory, self.health.clone())?;
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        let versions = models.entry(name).or_insert_with(BTreeMap::new);
        if versions.contains_key(&version) {
            // lost a race with a concurrent load of the same version
            drop(models);
            scheduler.unload().wait();
            return Err(Error::InvalidConfig(format!("{} is already loaded", key)));
        }
        versions.insert(version, scheduler);
        log::info!("Model {} Registered", key);
        Ok(())
    }

    /// Stop routing to a model version and drain it. Requests already
    /// admitted still complete; wait on the returned [`Drain`] for that.
    pub fn unload_model(&self, name: &str, version: u64) -> Result<Drain> {
        let scheduler = {
            let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
            let versions = models
                .get_mut(name)
                .ok_or_else(|| Error::ModelUnavailable(format!("{}:{}", name, version)))?;
            let scheduler = versions
                .remove(&version)
                .ok_or_else(|| Error::ModelUnavailable(format!("{}:{}", name, version)))?;
            if versions.is_empty() {
                models.remove(name);
            }
            scheduler
        };
        Ok(scheduler.unload())
    }

    /// Route a request to its model. Without a pinned version the highest
    /// servable version is used.
    pub fn enqueue(&self, request: InferRequest) -> Result<Ticket> {
        let scheduler = self
            .scheduler(request.model(), request.model_version())
            .filter(Scheduler::is_servable)
            .ok_or_else(|| {
                let version = request
                    .model_version()
                    .map_or_else(|| "latest".to_string(), |version| version.to_string());
                Error::ModelUnavailable(format!("{}:{}", request.model(), version))
            })?;
        scheduler.enqueue(request)
    }

    /// Cancel a request that is not dispatched yet.
    pub fn cancel(&self, ticket: &Ticket) -> Result<()> {
        ticket.cancel()
    }

    /// Whether a model version (or, with `None`, any version) accepts requests.
    pub fn is_servable(&self, name: &str, version: Option<u64>) -> bool {
        self.scheduler(name, version)
            .map_or(false, |scheduler| scheduler.is_servable())
    }

    /// Scheduler of a model version. With `None`, the highest servable
    /// version, falling back to the highest loaded one.
    pub fn scheduler(&self, name: &str, version: Option<u64>) -> Option<Scheduler> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let versions = models.get(name)?;
        match version {
            Some(version) => versions.get(&version).cloned(),
            None => versions
                .values()
                .rev()
                .find(|scheduler| scheduler.is_servable())
                .or_else(|| versions.values().next_back())
                .cloned(),
        }
    }

    /// Every loaded model version, sorted by name then version.
    pub fn models(&self) -> Vec<ModelStatus> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let mut status: Vec<_> = models
            .iter()
            .flat_map(|(name, versions)| {
                versions.iter().map(move |(&version, scheduler)| ModelStatus {
                    name: name.clone(),
                    version,
                    servable: scheduler.is_servable(),
                })
            })
            .collect();
        status.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
        status
    }

    /// Statistics of every loaded model version.
    pub fn stats(&self) -> Vec<Stats> {
        let schedulers: Vec<Scheduler> = {
            let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
            models
                .values()
                .flat_map(|versions| versions.values().cloned())
                .collect()
        };
        schedulers
            .iter()
            .filter_map(|scheduler| scheduler.stats().ok())
            .collect()
    }

    /// Unload every model; the drains complete independently.
    pub fn shutdown(&self) -> Vec<Drain> {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        models
            .drain()
            .flat_map(|(_, versions)| versions.into_iter().map(|(_, scheduler)| scheduler))
            .map(|scheduler| scheduler.unload())
            .collect()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
