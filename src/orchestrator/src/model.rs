//! Backend interface and the batch handed to it.
use crate::{
    config::Device,
    instance::InstanceId,
    request::{InferRequest, Pending, RequestId, Tensor},
};
use std::{sync::Arc, time::Instant};

/// All backend models managed by the scheduler implement Inference.
/// One value is created per instance and only ever runs one batch at a time,
/// but it is moved onto the instance's worker thread, hence Send + Sync.
pub trait Inference: Send + Sync {
    /// Run one batch. Blocking; called on the instance's worker thread.
    fn execute(&self, batch: &Batch) -> Result<BatchOutput, String>;

    /// Release device resources when the instance is removed.
    fn unload(&self) {}
}

/// Builds the backend of one instance for its device.
pub type ModelFactory =
    Arc<dyn Fn(&Device) -> Result<Box<dyn Inference>, String> + Send + Sync>;

/// Result of one batch execution.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutput {
    /// One output set per request, in input order. Any other length is a
    /// partial failure and fails the whole batch.
    Batched(Vec<Vec<Tensor>>),
    /// Fine-grained status: every request gets its own outcome.
    PerRequest(Vec<Result<Vec<Tensor>, String>>),
}

/// An ordered group of requests executed in one backend call.
pub struct Batch {
    id: u64,
    requests: Vec<Pending>,
    rows: usize,
    target: Option<InstanceId>,
    cut_time: Instant,
}

impl Batch {
    pub(crate) fn new(id: u64, requests: Vec<Pending>, target: Option<InstanceId>) -> Self {
        assert!(!requests.is_empty(), "empty batch {}", id);
        let rows = requests.iter().map(Pending::rows).sum();
        Batch {
            id,
            requests,
            rows,
            target,
            cut_time: Instant::now(),
        }
    }

    /// Batch id, unique per model
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True once every member was cancelled
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Total rows; never above the model's max batch size
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Members in execution order
    pub fn requests(&self) -> impl Iterator<Item = &InferRequest> {
        self.requests.iter().map(|pending| &pending.request)
    }

    /// When the assembler cut the batch
    pub fn cut_time(&self) -> Instant {
        self.cut_time
    }

    pub(crate) fn target(&self) -> Option<InstanceId> {
        self.target
    }

    pub(crate) fn pending(&self) -> &[Pending] {
        &self.requests
    }

    pub(crate) fn into_pending(self) -> Vec<Pending> {
        self.requests
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<Pending> {
        let index = self.requests.iter().position(|pending| pending.id == id)?;
        let pending = self.requests.remove(index);
        self.rows -= pending.rows();
        Some(pending)
    }
}

#[cfg(test)]
pub(crate) use fake::*;
