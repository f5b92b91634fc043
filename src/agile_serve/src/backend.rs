//! Simulated backend: echoes its inputs after a configurable latency.
use orchestrator::{Batch, BatchOutput, Device, Inference, ModelFactory};
use std::{sync::Arc, thread, time::Duration};

/// Stand-in for a real model. Execution time is
/// `latency + per_row * rows`, so batching pays off as it would on a device.
pub struct SimulatedModel {
    device: Device,
    latency: Duration,
    per_row: Duration,
}

impl SimulatedModel {
    /// Create a model bound to `device`
    pub fn new(device: Device, latency: Duration, per_row: Duration) -> Self {
        SimulatedModel {
            device,
            latency,
            per_row,
        }
    }

    /// One model per instance, all with the same timing.
    pub fn factory(latency: Duration, per_row: Duration) -> ModelFactory {
        Arc::new(move |device: &Device| {
            log::debug!("loading simulated model on {}", device);
            let model: Box<dyn Inference> =
                Box::new(SimulatedModel::new(*device, latency, per_row));
            Ok(model)
        })
    }
}

impl Inference for SimulatedModel {
    fn execute(&self, batch: &Batch) -> Result<BatchOutput, String> {
        let rows = batch.rows() as u32;
        log::trace!(
            "batch {} reached {} {:?} after its cut",
            batch.id(),
            self.device,
            batch.cut_time().elapsed()
        );
        thread::sleep(self.latency + self.per_row * rows);
        Ok(BatchOutput::Batched(
            batch.requests().map(|request| request.inputs().to_vec()).collect(),
        ))
    }

    fn unload(&self) {
        log::debug!("released simulated model on {}", self.device);
    }
}
