//! Requests, tickets and per-request completion channels.
use crate::{
    config::Device,
    error::{Error, Result},
    instance::InstanceId,
    scheduler::Scheduler,
};
use crossbeam::channel;
use std::time::{Duration, Instant};

/// Scheduler-assigned request id, unique per model.
pub type RequestId = u64;
/// Client-chosen id tying the requests of one sequence together.
pub type CorrelationId = u64;
/// What a ticket eventually receives.
pub type Response = Result<InferResponse>;
/// A correlation id together with the generation of the sequence living
/// under it. Ids are reused once a sequence ends.
pub(crate) type SequenceRef = (CorrelationId, u64);

/// A named tensor. The payload layout is opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Tensor name
    pub name: String,
    /// Dimensions, batch dimension first
    pub shape: Vec<usize>,
    /// Raw bytes
    pub data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor
    pub fn new(name: &str, shape: Vec<usize>, data: Vec<u8>) -> Self {
        Tensor {
            name: name.to_string(),
            shape,
            data,
        }
    }
}

/// Sequence markers carried by stateful requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceControl {
    /// Sequence the request belongs to
    pub correlation_id: CorrelationId,
    /// First request of the sequence
    pub start: bool,
    /// Last request of the sequence
    pub end: bool,
}

/// An inference request as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct InferRequest {
    model: String,
    version: Option<u64>,
    inputs: Vec<Tensor>,
    batch_size: usize,
    sequence: Option<SequenceControl>,
    priority: u32,
    deadline: Option<Instant>,
}

impl InferRequest {
    /// Request for the latest version of `model`, one row, priority 0.
    pub fn new(model: &str, inputs: Vec<Tensor>) -> Self {
        InferRequest {
            model: model.to_string(),
            version: None,
            inputs,
            batch_size: 1,
            sequence: None,
            priority: 0,
            deadline: None,
        }
    }

    /// Pin a model version
    pub fn version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Rows this request contributes to a batch
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Mark the request as a step of sequence `correlation_id`
    pub fn sequence(mut self, correlation_id: CorrelationId, start: bool, end: bool) -> Self {
        self.sequence = Some(SequenceControl {
            correlation_id,
            start,
            end,
        });
        self
    }

    /// Larger is more urgent
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Give up on the request if it is not batched by `deadline`
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    /// Target model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Target version, `None` for the latest servable one
    pub fn model_version(&self) -> Option<u64> {
        self.version
    }

    /// Input tensors
    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    /// Rows of this request
    pub fn rows(&self) -> usize {
        self.batch_size
    }

    /// Sequence markers, if any
    pub fn sequence_control(&self) -> Option<SequenceControl> {
        self.sequence
    }

    /// Priority level
    pub fn priority_level(&self) -> u32 {
        self.priority
    }

    /// Deadline, if any
    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Successful completion of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct InferResponse {
    /// Id the ticket was issued with
    pub request_id: RequestId,
    /// Output tensors of this request
    pub outputs: Vec<Tensor>,
    /// Instance that executed the batch
    pub instance: InstanceId,
    /// Device of that instance
    pub device: Device,
    /// Total rows of the executed batch
    pub batch_rows: usize,
    /// Step number within the sequence, starting at 0
    pub sequence_step: Option<u64>,
    /// Time from arrival to dispatch
    pub queue_time: Duration,
}

/// A request while the scheduler owns it.
pub(crate) struct Pending {
    pub id: RequestId,
    pub request: InferRequest,
    pub arrive_time: Instant,
    pub step: Option<u64>,
    pub generation: u64,
    response_tx: channel::Sender<Response>,
}

impl Pending {
    pub fn new(id: RequestId, request: InferRequest) -> (Self, channel::Receiver<Response>) {
        let (response_tx, response_rx) = channel::bounded(1);
        let pending = Pending {
            id,
            request,
            arrive_time: Instant::now(),
            step: None,
            generation: 0,
            response_tx,
        };
        (pending, response_rx)
    }

    pub fn rows(&self) -> usize {
        self.request.batch_size
    }

    pub fn priority(&self) -> u32 {
        self.request.priority_level()
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.request.sequence.map(|control| control.correlation_id)
    }

    /// The sequence this step was admitted to.
    pub fn sequence_ref(&self) -> Option<SequenceRef> {
        self.correlation_id().map(|id| (id, self.generation))
    }

    pub fn is_sequence_end(&self) -> bool {
        self.request.sequence.map_or(false, |control| control.end)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.request
            .deadline_at()
            .map_or(false, |deadline| deadline <= now)
    }

    /// Deliver the completion. Consuming `self` makes it exactly-once.
    pub fn respond(self, response: Response) {
        // the caller may have dropped its ticket
        let _ = self.response_tx.send(response);
    }

    pub fn fail(self, error: Error) {
        self.respond(Err(error))
    }
}

/// Returned by enqueue; receives exactly one completion.
#[derive(Debug)]
pub struct Ticket {
    id: RequestId,
    scheduler: Scheduler,
    response_rx: channel::Receiver<Response>,
}

impl Ticket {
    pub(crate) fn new(
        id: RequestId,
        scheduler: Scheduler,
        response_rx: channel::Receiver<Response>,
    ) -> Self {
        Ticket {
            id,
            scheduler,
            response_rx,
        }
    }

    /// Request id
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// `name:version` of the model serving this request
    pub fn model_key(&self) -> String {
        self.scheduler.config().key()
    }

    /// Block until the request completes.
    pub fn recv(&self) -> Response {
        match self.response_rx.recv() {
            Ok(response) => response,
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Block at most `timeout`, `None` if the request is still pending.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Response> {
        match self.response_rx.recv_timeout(timeout) {
            Ok(response) => Some(response),
            Err(channel::RecvTimeoutError::Timeout) => None,
            Err(channel::RecvTimeoutError::Disconnected) => Some(Err(Error::Disconnected)),
        }
    }

    /// Poll without blocking.
    pub fn try_recv(&self) -> Option<Response> {
        match self.response_rx.try_recv() {
            Ok(response) => Some(response),
            Err(channel::TryRecvError::Empty) => None,
            Err(channel::TryRecvError::Disconnected) => Some(Err(Error::Disconnected)),
        }
    }

    /// Cancel the request if it is not dispatched yet.
    pub fn cancel(&self) -> Result<()> {
        self.scheduler.cancel(self.id)
    }

    /// Detached cancellation handle, e.g. for a drop guard.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            id: self.id,
            scheduler: self.scheduler.clone(),
        }
    }
}

/// Cancels one request without owning its ticket.
#[derive(Clone, Debug)]
pub struct Canceller {
    id: RequestId,
    scheduler: Scheduler,
}

impl Canceller {
    /// Same as [`Ticket::cancel`]
    pub fn cancel(&self) -> Result<()> {
        self.scheduler.cancel(self.id)
    }
}

#[cfg(test)]
pub(crate) fn fake_pending(id: RequestId, rows: usize) -> (Pending, channel::Receiver<Response>) {
    Pending::new(id, InferRequest::new("fake", vec![]).batch_size(rows))
}
