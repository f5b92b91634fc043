//! gRPC front API for the orchestrator.
//! Tensor payloads travel lz4 compressed with their size prepended.

tonic::include_proto!("api");

use orchestrator::{Canceller, Error, ModelConfig, ModelFactory, Orchestrator};
use std::{sync::Arc, thread, time::Duration};
use tokio::sync::oneshot;
use tonic::{Request, Response, Status};

/// Builds the configuration and backend of a model named in a LoadModel call.
pub type Loader =
    Arc<dyn Fn(&str, u64) -> orchestrator::Result<(ModelConfig, ModelFactory)> + Send + Sync>;

/// The gRPC service
pub struct Service {
    orchestrator: Arc<Orchestrator>,
    loader: Option<Loader>,
}

impl Service {
    /// Create a Service
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Service {
            orchestrator,
            loader: None,
        }
    }

    /// Accept LoadModel calls, building models with `loader`
    pub fn with_loader(mut self, loader: Loader) -> Self {
        self.loader = Some(loader);
        self
    }
}

/// Map a scheduling error to the status the client sees.
pub fn status(err: Error) -> Status {
    let message = err.to_string();
    match err {
        Error::ModelUnavailable(_) | Error::Disconnected => Status::unavailable(message),
        Error::QueueOverflow { .. } => Status::resource_exhausted(message),
        Error::Cancelled(_) => Status::cancelled(message),
        Error::DeadlineExceeded(_) => Status::deadline_exceeded(message),
        Error::InvalidRequest(_) | Error::InvalidConfig(_) => Status::invalid_argument(message),
        Error::SequenceConflict { .. } | Error::AlreadyDispatched(_) => {
            Status::failed_precondition(message)
        }
        Error::SequenceTimeout(_) => Status::aborted(message),
        Error::RequestNotFound(_) => Status::not_found(message),
        Error::ExecutionFailed(_) | Error::LoadFailed(_) => Status::internal(message),
    }
}

/// Compress a tensor for the wire.
pub fn compress(tensor: &orchestrator::Tensor) -> Tensor {
    Tensor {
        name: tensor.name.clone(),
        shape: tensor.shape.iter().map(|&dim| dim as u64).collect(),
        compressed_data: lz4_flex::compress_prepend_size(&tensor.data),
    }
}

fn decompress(tensor: Tensor) -> Result<orchestrator::Tensor, Status> {
    let data = lz4_flex::decompress_size_prepended(&tensor.compressed_data).map_err(|err| {
        Status::invalid_argument(format!("tensor {} is corrupt: {:?}", tensor.name, err))
    })?;
    let shape = tensor.shape.iter().map(|&dim| dim as usize).collect();
    Ok(orchestrator::Tensor::new(&tensor.name, shape, data))
}

fn decode(request: InferRequest) -> Result<orchestrator::InferRequest, Status> {
    let inputs = request
        .inputs
        .into_iter()
        .map(decompress)
        .collect::<Result<Vec<_>, _>>()?;
    let mut decoded = orchestrator::InferRequest::new(&request.model, inputs)
        .batch_size(request.batch_size.max(1) as usize)
        .priority(request.priority);
    if request.version > 0 {
        decoded = decoded.version(request.version);
    }
    if let Some(sequence) = request.sequence {
        decoded = decoded.sequence(sequence.correlation_id, sequence.start, sequence.end);
    }
    if request.timeout_us > 0 {
        decoded = decoded.timeout(Duration::from_micros(request.timeout_us));
    }
    Ok(decoded)
}

fn encode(response: orchestrator::InferResponse) -> InferResponse {
    InferResponse {
        request_id: response.request_id,
        outputs: response.outputs.iter().map(compress).collect(),
        instance: response.instance as u64,
        batch_rows: response.batch_rows as u64,
        queue_time_us: response.queue_time.as_micros() as u64,
        sequence: response.sequence_step.is_some(),
        sequence_step: response.sequence_step.unwrap_or(0),
    }
}

fn model_stats(stats: orchestrator::Stats) -> ModelStats {
    let micros = |duration: Duration| duration.as_micros() as u64;
    ModelStats {
        model: stats.model,
        servable: stats.servable,
        queue_depth: stats.queue_depth as u64,
        ready_batches: stats.ready_batches as u64,
        in_flight: stats.in_flight as u64,
        active_sequences: stats.active_sequences as u64,
        batch_sizes: stats
            .batch_sizes
            .into_iter()
            .map(|(rows, batches)| (rows as u64, batches))
            .collect(),
        queue_latency: Some(LatencyStats {
            count: stats.queue_latency.count,
            total_us: micros(stats.queue_latency.total),
            max_us: micros(stats.queue_latency.max),
        }),
        completed_requests: stats.completed_requests,
        rejected_requests: stats.rejected_requests,
        cancelled_requests: stats.cancelled_requests,
        expired_requests: stats.expired_requests,
        instances: stats
            .instances
            .into_iter()
            .map(|instance| InstanceStats {
                id: instance.id as u64,
                device: instance.device.to_string(),
                state: format!("{:?}", instance.state),
                completed_batches: instance.completed_batches,
                failed_batches: instance.failed_batches,
                busy_time_us: micros(instance.busy_time),
                utilization: instance.utilization,
            })
            .collect(),
    }
}

/// Cancels the request when the handler future is dropped before completion,
/// i.e. when the client went away.
struct CancelOnDrop(Option<Canceller>);

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(canceller) = self.0.take() {
            // too late once dispatched; the result is then discarded
            if canceller.cancel().is_ok() {
                log::debug!("cancelled request of a departed client");
            }
        }
    }
}

#[tonic::async_trait]
impl infer_server::Infer for Service {
    async fn infer(
        &self,
        request: Request<InferRequest>,
    ) -> Result<Response<InferResponse>, Status> {
        let request = decode(request.into_inner())?;
        let ticket = self.orchestrator.enqueue(request).map_err(status)?;
        let mut guard = CancelOnDrop(Some(ticket.canceller()));
        let (tx, rx) = oneshot::channel();
        thread::spawn(move || {
            let _ = tx.send(ticket.recv());
        });
        let response = rx
            .await
            .map_err(|_| Status::internal("request was dropped by the scheduler"))?;
        guard.disarm();
        Ok(Response::new(encode(response.map_err(status)?)))
    }

    async fn model_ready(
        &self,
        request: Request<ModelReadyRequest>,
    ) -> Result<Response<ModelReadyResponse>, Status> {
        let request = request.into_inner();
        let version = Some(request.version).filter(|&version| version > 0);
        Ok(Response::new(ModelReadyResponse {
            ready: self.orchestrator.is_servable(&request.model, version),
        }))
    }

    async fn server_live(
        &self,
        _request: Request<ServerLiveRequest>,
    ) -> Result<Response<ServerLiveResponse>, Status> {
        Ok(Response::new(ServerLiveResponse { live: true }))
    }

    async fn server_ready(
        &self,
        _request: Request<ServerReadyRequest>,
    ) -> Result<Response<ServerReadyResponse>, Status> {
        let ready = self.orchestrator.models().iter().any(|model| model.servable);
        Ok(Response::new(ServerReadyResponse { ready }))
    }

    async fn load_model(
        &self,
        request: Request<LoadModelRequest>,
    ) -> Result<Response<LoadModelResponse>, Status> {
        let request = request.into_inner();
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| Status::unimplemented("models are not loaded on demand"))?;
        let (config, factory) = loader(&request.model, request.version.max(1)).map_err(status)?;
        // loading blocks until every instance is up
        let orchestrator = self.orchestrator.clone();
        let (tx, rx) = oneshot::channel();
        thread::spawn(move || {
            let _ = tx.send(orchestrator.load_model(config, factory));
        });
        rx.await
            .map_err(|_| Status::internal("model load was interrupted"))?
            .map_err(status)?;
        Ok(Response::new(LoadModelResponse {}))
    }

    async fn unload_model(
        &self,
        request: Request<UnloadModelRequest>,
    ) -> Result<Response<UnloadModelResponse>, Status> {
        let request = request.into_inner();
        let versions: Vec<u64> = if request.version > 0 {
            vec![request.version]
        } else {
            self.orchestrator
                .models()
                .into_iter()
                .filter(|model| model.name == request.model)
                .map(|model| model.version)
                .collect()
        };
        if versions.is_empty() {
            let key = format!("{}:latest", request.model);
            return Err(status(Error::ModelUnavailable(key)));
        }
        let drains = versions
            .into_iter()
            .map(|version| self.orchestrator.unload_model(&request.model, version))
            .collect::<orchestrator::Result<Vec<_>>>()
            .map_err(status)?;
        let (tx, rx) = oneshot::channel();
        thread::spawn(move || {
            for drain in &drains {
                drain.wait();
            }
            let _ = tx.send(());
        });
        rx.await.map_err(|_| Status::internal("drain was interrupted"))?;
        log::info!("model {} unloaded on request", request.model);
        Ok(Response::new(UnloadModelResponse {}))
    }

    async fn model_statistics(
        &self,
        request: Request<ModelStatisticsRequest>,
    ) -> Result<Response<ModelStatisticsResponse>, Status> {
        let request = request.into_inner();
        let prefix = format!("{}:", request.model);
        let mut models: Vec<ModelStats> = self
            .orchestrator
            .stats()
            .into_iter()
            .filter(|stats| request.model.is_empty() || stats.model.starts_with(&prefix))
            .map(model_stats)
            .collect();
        models.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(Response::new(ModelStatisticsResponse { models }))
    }
}
