//! Per-model scheduler.
//!
//! A single thread owns the request queue, the sequence tracker and the
//! instance pool of one model version. Callers, executors and timers only
//! reach that state through [`Command`]s, so every decision is serialized and
//! nothing is shared across threads except the channel.
use crate::{
    batcher::{Batcher, Candidates, Decision},
    config::ModelConfig,
    dispatcher::Dispatcher,
    error::{Error, Result},
    executor::{Executor, Report},
    instance::{HealthChange, HealthEvent, Instance, InstanceId},
    model::{Batch, ModelFactory},
    queue::RequestQueue,
    request::{InferRequest, Pending, RequestId, SequenceRef, Ticket},
    sequence::SequenceTracker,
    stats::{Counters, Stats},
};
use crossbeam::channel;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Command to the scheduler thread
pub(crate) enum Command {
    /// Enqueue(request, admission result)
    Enqueue(Pending, channel::Sender<Result<()>>),
    /// Cancel(request_id, result)
    Cancel(RequestId, channel::Sender<Result<()>>),
    /// InstanceLoaded(instance, backend load result)
    InstanceLoaded(InstanceId, std::result::Result<(), String>),
    /// ExecutorFinish(instance, report)
    ExecutorFinish(InstanceId, Report),
    /// Unload(signalled once drained)
    Unload(channel::Sender<()>),
    /// Stats(snapshot)
    Stats(channel::Sender<Stats>),
}

/// Handle to the scheduler of one model version. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Scheduler {
    tx: channel::Sender<Command>,
    config: Arc<ModelConfig>,
    servable: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl Scheduler {
    /// Validate `config`, create its instances and start scheduling.
    ///
    /// Blocks until every instance has tried to load. Instances that fail are
    /// reported on `health` and left out; if none loads the model is not
    /// started.
    pub fn start(
        config: ModelConfig,
        factory: ModelFactory,
        health: Option<channel::Sender<HealthEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        let key = config.key();
        let (tx, rx) = channel::unbounded();
        let mut instances = vec![];
        for (id, device) in config.devices().into_iter().enumerate() {
            let executor = Executor::spawn(&key, id, device, factory.clone(), tx.clone())
                .map_err(|err| Error::LoadFailed(format!("{} instance {}: {}", key, id, err)))?;
            instances.push(Instance::new(id, device, executor));
        }
        let mut loading = instances.len();
        while loading > 0 {
            match rx.recv() {
                Ok(Command::InstanceLoaded(id, result)) => {
                    if let Err(reason) = &result {
                        log::error!("{} instance {} failed to load: {}", key, id, reason);
                        if let Some(health) = &health {
                            let _ = health.send(HealthEvent::LoadFailed {
                                model: key.clone(),
                                instance: id,
                                reason: reason.clone(),
                            });
                        }
                    }
                    instances[id].loaded(result);
                    loading -= 1;
                }
                Ok(_) => {}
                Err(_) => return Err(Error::LoadFailed(key)),
            }
        }
        let mut dispatcher = Dispatcher::new(instances);
        if !dispatcher.is_servable() {
            dispatcher.drain();
            return Err(Error::LoadFailed(format!("{}: no instance loaded", key)));
        }
        let servable = Arc::new(AtomicBool::new(true));
        let core = Core::new(config.clone(), dispatcher, health, servable.clone());
        thread::Builder::new()
            .name(format!("{}-scheduler", key))
            .spawn(move || core.run(rx))
            .map_err(|err| Error::LoadFailed(format!("{}: {}", key, err)))?;
        log::info!("Model {} loaded", key);
        Ok(Scheduler {
            tx,
            config: Arc::new(config),
            servable,
            next_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Configuration the scheduler runs with
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// False once unloading started or no instance is left
    pub fn is_servable(&self) -> bool {
        self.servable.load(Ordering::SeqCst)
    }

    fn unavailable(&self) -> Error {
        Error::ModelUnavailable(self.config.key())
    }

    /// Admit a request. Returns once the request is queued or rejected.
    pub fn enqueue(&self, request: InferRequest) -> Result<Ticket> {
        let wrong_version = request
            .model_version()
            .map_or(false, |version| version != self.config.version);
        if request.model() != self.config.name || wrong_version {
            let version = request
                .model_version()
                .map_or_else(|| "latest".to_string(), |version| version.to_string());
            return Err(Error::ModelUnavailable(format!(
                "{}:{}",
                request.model(),
                version
            )));
        }
        if !self.is_servable() {
            return Err(self.unavailable());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (pending, response_rx) = Pending::new(id, request);
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.tx
            .send(Command::Enqueue(pending, reply_tx))
            .map_err(|_| self.unavailable())?;
        match reply_rx.recv() {
            Ok(Ok(())) => Ok(Ticket::new(id, self.clone(), response_rx)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(self.unavailable()),
        }
    }

    /// Cancel a request that is not dispatched yet. Its ticket receives
    /// `Cancelled`.
    pub fn cancel(&self, id: RequestId) -> Result<()> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.tx
            .send(Command::Cancel(id, reply_tx))
            .map_err(|_| Error::RequestNotFound(id))?;
        reply_rx.recv().map_err(|_| Error::RequestNotFound(id))?
    }

    /// Stop accepting requests and drain: queued work is still executed,
    /// then every instance is released.
    pub fn unload(&self) -> Drain {
        self.servable.store(false, Ordering::SeqCst);
        let (done_tx, done_rx) = channel::bounded(1);
        // a scheduler that is already gone counts as drained
        let _ = self.tx.send(Command::Unload(done_tx));
        Drain { rx: done_rx }
    }

    /// Snapshot of queue, batch and instance statistics.
    pub fn stats(&self) -> Result<Stats> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.tx
            .send(Command::Stats(reply_tx))
            .map_err(|_| Error::Disconnected)?;
        reply_rx.recv().map_err(|_| Error::Disconnected)
    }
}

/// Completes when an unloading model has finished all its work.
#[derive(Debug)]
pub struct Drain {
    rx: channel::Receiver<()>,
}

impl Drain {
    /// Block until drained.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Block at most `timeout`; true if drained.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(
            self.rx.recv_timeout(timeout),
            Err(channel::RecvTimeoutError::Timeout)
        )
    }

    /// Poll without blocking.
    pub fn is_done(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(channel::TryRecvError::Empty))
    }
}

struct Core {
    key: String,
    config: ModelConfig,
    batcher: Batcher,
    queue: RequestQueue,
    sequences: Option<SequenceTracker>,
    dispatcher: Dispatcher,
    in_flight: HashMap<RequestId, InstanceId>,
    accepting: bool,
    drain_waiters: Vec<channel::Sender<()>>,
    servable: Arc<AtomicBool>,
    health: Option<channel::Sender<HealthEvent>>,
    next_batch_id: u64,
    counters: Counters,
}

impl Core {
    fn new(
        config: ModelConfig,
        dispatcher: Dispatcher,
        health: Option<channel::Sender<HealthEvent>>,
        servable: Arc<AtomicBool>,
    ) -> Self {
        Core {
            key: config.key(),
            batcher: Batcher::new(config.max_batch_size, config.batching().cloned()),
            queue: RequestQueue::new(),
            sequences: config.sequence().map(SequenceTracker::new),
            dispatcher,
            in_flight: HashMap::new(),
            accepting: true,
            drain_waiters: vec![],
            servable,
            health,
            next_batch_id: 0,
            counters: Counters::default(),
            config,
        }
    }

    fn run(mut self, rx: channel::Receiver<Command>) {
        loop {
            let received = match self.next_deadline(Instant::now()) {
                Some(deadline) => rx.recv_deadline(deadline).map_err(|err| err.is_disconnected()),
                None => rx.recv().map_err(|_| true),
            };
            match received {
                Ok(command) => self.handle(command),
                Err(true) => break,
                Err(false) => {}
            }
            let now = Instant::now();
            self.expire_sequences(now);
            self.schedule(now);
            if !self.accepting && self.finish_drain() {
                return;
            }
        }
        // every handle and worker is gone: pending tickets see `Disconnected`
        log::warn!("scheduler of {} lost all handles", self.key);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(pending, reply) => {
                let result = self.admit(pending);
                if result.is_err() {
                    self.counters.rejected += 1;
                }
                let _ = reply.send(result);
            }
            Command::Cancel(id, reply) => {
                let _ = reply.send(self.cancel(id));
            }
            Command::InstanceLoaded(id, _) => {
                log::warn!("{} instance {} reported a late load", self.key, id);
            }
            Command::ExecutorFinish(instance, report) => self.finish(instance, report),
            Command::Unload(done) => {
                if self.accepting {
                    log::info!("Unloading model {}", self.key);
                    self.accepting = false;
                    self.servable.store(false, Ordering::SeqCst);
                }
                self.drain_waiters.push(done);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Requests admitted but not dispatched.
    fn waiting(&self) -> usize {
        let sequenced = self.sequences.as_ref().map_or(0, SequenceTracker::queued);
        self.queue.len() + sequenced + self.dispatcher.ready_requests()
    }

    fn admit(&mut self, pending: Pending) -> Result<()> {
        if !self.accepting || !self.dispatcher.is_servable() {
            return Err(Error::ModelUnavailable(self.key.clone()));
        }
        let rows = pending.rows();
        if rows == 0 || rows > self.config.max_batch_size {
            return Err(Error::InvalidRequest(format!(
                "{} rows, {} accepts 1..={}",
                rows, self.key, self.config.max_batch_size
            )));
        }
        if let Some(capacity) = self.config.max_queue_size {
            if self.waiting() >= capacity {
                log::warn!("{} queue full, rejecting request {}", self.key, pending.id);
                return Err(Error::QueueOverflow { capacity });
            }
        }
        match &mut self.sequences {
            Some(tracker) => {
                let accepting = self.dispatcher.accepting();
                tracker.admit(pending, &accepting, Instant::now())
            }
            None => match pending.correlation_id() {
                Some(correlation_id) => Err(Error::SequenceConflict {
                    correlation_id,
                    reason: format!("{} does not batch sequences", self.key),
                }),
                None => {
                    self.queue.push(pending);
                    Ok(())
                }
            },
        }
    }

    fn cancel(&mut self, id: RequestId) -> Result<()> {
        let mut found = self.queue.remove(id);
        if found.is_none() {
            if let Some(tracker) = &mut self.sequences {
                found = tracker.remove(id);
            }
        }
        if found.is_none() {
            // cut but not dispatched: its step already counts as in flight
            found = self.dispatcher.remove(id);
            if let (Some(pending), Some(tracker)) = (&found, &mut self.sequences) {
                if let Some(sequence) = pending.sequence_ref() {
                    tracker.finished(sequence, Instant::now());
                }
            }
        }
        match found {
            Some(pending) => {
                log::debug!("request {} of {} cancelled", id, self.key);
                self.counters.cancelled += 1;
                pending.fail(Error::Cancelled(id));
                Ok(())
            }
            None if self.in_flight.contains_key(&id) => Err(Error::AlreadyDispatched(id)),
            None => Err(Error::RequestNotFound(id)),
        }
    }

    fn finish(&mut self, instance: InstanceId, report: Report) {
        let now = Instant::now();
        log::debug!(
            "batch {} ({} rows) finished on {} instance {} in {:?}",
            report.batch_id,
            report.rows,
            self.key,
            instance,
            report.elapsed
        );
        for (id, sequence) in &report.requests {
            self.in_flight.remove(id);
            if let (Some(tracker), Some(sequence)) = (&mut self.sequences, sequence) {
                tracker.finished(*sequence, now);
            }
        }
        self.counters.completed += report.requests.len() as u64;
        let threshold = self.config.unhealthy_threshold;
        let change = self
            .dispatcher
            .finish(instance, report.failed, report.elapsed, threshold);
        let event = match change {
            Some(HealthChange::Unhealthy(consecutive_failures)) => {
                log::error!(
                    "{} instance {} failed {} batches in a row",
                    self.key,
                    instance,
                    consecutive_failures
                );
                HealthEvent::Unhealthy {
                    model: self.key.clone(),
                    instance,
                    consecutive_failures,
                }
            }
            Some(HealthChange::Recovered) => {
                log::info!("{} instance {} recovered", self.key, instance);
                HealthEvent::Recovered {
                    model: self.key.clone(),
                    instance,
                }
            }
            None => return,
        };
        if let Some(health) = &self.health {
            let _ = health.send(event);
        }
    }

    fn expire_sequences(&mut self, now: Instant) {
        if let Some(tracker) = &mut self.sequences {
            for correlation_id in tracker.expire(now) {
                log::warn!("sequence {} of {} timed out", correlation_id, self.key);
            }
        }
    }

    fn queue_candidates(&self) -> Option<Candidates> {
        Some(Candidates {
            rows: self.queue.rows(),
            front_rows: self.queue.front_rows()?,
            oldest_arrival: self.queue.oldest_arrival()?,
        })
    }

    /// Cut every batch the triggers allow, then bind ready batches to idle
    /// instances.
    fn schedule(&mut self, now: Instant) {
        match self.sequences.take() {
            Some(mut tracker) => {
                self.assemble_sequences(&mut tracker, now);
                self.sequences = Some(tracker);
            }
            None => self.assemble(now),
        }
        for dispatched in self.dispatcher.dispatch() {
            self.counters.record_batch(dispatched.rows);
            for (id, _, arrive_time) in dispatched.requests {
                self.counters
                    .queue_latency
                    .record(now.saturating_duration_since(arrive_time));
                self.in_flight.insert(id, dispatched.instance);
            }
        }
        let (lost, stranded) = self.dispatcher.take_lost();
        if !lost.is_empty() {
            self.abandon(&lost, stranded);
        }
    }

    /// Fail the work that no remaining instance can run.
    fn abandon(&mut self, lost: &[InstanceId], stranded: Vec<Batch>) {
        let mut failed: Vec<Pending> = stranded
            .into_iter()
            .flat_map(Batch::into_pending)
            .collect();
        if let Some(tracker) = &mut self.sequences {
            for &instance in lost {
                failed.extend(tracker.release_instance(instance));
            }
        }
        if !self.dispatcher.is_servable() {
            log::error!("{} has no instance left", self.key);
            self.servable.store(false, Ordering::SeqCst);
            failed.extend(self.queue.pop_batch(usize::MAX, None));
        }
        for pending in failed {
            let id = pending.id;
            log::warn!("request {} of {} lost its instance", id, self.key);
            pending.fail(Error::ExecutionFailed(format!(
                "request {}: instance worker is gone",
                id
            )));
        }
    }

    fn assemble(&mut self, now: Instant) {
        loop {
            let idle = self.dispatcher.has_unclaimed_idle();
            match self.batcher.decide(self.queue_candidates(), now, idle) {
                Decision::Cut { max_rows, overdue } => {
                    let members = self.queue.pop_batch(max_rows, overdue);
                    self.cut(members, None, now);
                }
                Decision::Wait(_) => break,
            }
        }
    }

    // sequence heads are batched per instance, for that instance only
    fn assemble_sequences(&mut self, tracker: &mut SequenceTracker, now: Instant) {
        for instance in self.dispatcher.accepting() {
            loop {
                let idle = self.dispatcher.is_unclaimed_idle(instance);
                match self.batcher.decide(tracker.candidates(instance), now, idle) {
                    Decision::Cut { max_rows, overdue } => {
                        let members = tracker.pop_batch(instance, max_rows, overdue, now);
                        for sequence in self.cut(members, Some(instance), now) {
                            tracker.finished(sequence, now);
                        }
                    }
                    Decision::Wait(_) => break,
                }
            }
        }
    }

    /// Turn popped members into a ready batch. Members past their deadline
    /// fail instead; the sequences of failed steps are returned so the
    /// tracker stops counting them as in flight.
    fn cut(
        &mut self,
        members: Vec<Pending>,
        target: Option<InstanceId>,
        now: Instant,
    ) -> Vec<SequenceRef> {
        let (expired, members): (Vec<_>, Vec<_>) =
            members.into_iter().partition(|pending| pending.is_expired(now));
        let mut released = vec![];
        for pending in expired {
            let id = pending.id;
            log::warn!("request {} of {} missed its deadline", id, self.key);
            self.counters.expired += 1;
            released.extend(pending.sequence_ref());
            pending.fail(Error::DeadlineExceeded(id));
        }
        if members.is_empty() {
            return released;
        }
        let rows: usize = members.iter().map(Pending::rows).sum();
        assert!(
            rows <= self.config.max_batch_size,
            "{}: batch of {} rows",
            self.key,
            rows
        );
        if target.is_some() {
            let mut sequences = HashSet::new();
            assert!(
                members
                    .iter()
                    .filter_map(Pending::correlation_id)
                    .all(|correlation_id| sequences.insert(correlation_id)),
                "{}: two steps of one sequence in a batch",
                self.key
            );
        }
        let batch = Batch::new(self.next_batch_id, members, target);
        self.next_batch_id += 1;
        log::debug!(
            "{} cut batch {} with {} requests ({} rows)",
            self.key,
            batch.id(),
            batch.len(),
            batch.rows()
        );
        self.dispatcher.push_ready(batch);
        released
    }

    /// Earliest instant a timer-driven decision is due.
    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let mut deadlines = vec![];
        match &self.sequences {
            Some(tracker) => {
                deadlines.push(tracker.next_deadline());
                for instance in self.dispatcher.accepting() {
                    let idle = self.dispatcher.is_unclaimed_idle(instance);
                    if let Decision::Wait(deadline) =
                        self.batcher.decide(tracker.candidates(instance), now, idle)
                    {
                        deadlines.push(deadline);
                    }
                }
            }
            None => {
                let idle = self.dispatcher.has_unclaimed_idle();
                if let Decision::Wait(deadline) =
                    self.batcher.decide(self.queue_candidates(), now, idle)
                {
                    deadlines.push(deadline);
                }
            }
        }
        deadlines.into_iter().flatten().min()
    }

    /// Release the instances once nothing is queued or executing. True when
    /// the model is fully drained.
    fn finish_drain(&mut self) -> bool {
        if self.waiting() > 0 || !self.in_flight.is_empty() {
            return false;
        }
        if let Some(tracker) = &mut self.sequences {
            let ended = tracker.end_idle();
            if ended > 0 {
                log::debug!("{} ended {} idle sequences", self.key, ended);
            }
        }
        self.dispatcher.drain();
        if !self.dispatcher.all_removed() {
            return false;
        }
        log::info!("Model {} unloaded", self.key);
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
        true
    }

    fn stats(&self) -> Stats {
        let counters = self.counters.clone();
        Stats {
            model: self.key.clone(),
            servable: self.accepting && self.dispatcher.is_servable(),
            queue_depth: self.queue.len()
                + self.sequences.as_ref().map_or(0, SequenceTracker::queued),
            ready_batches: self.dispatcher.ready_batches(),
            in_flight: self.in_flight.len(),
            active_sequences: self.sequences.as_ref().map_or(0, SequenceTracker::active),
            batch_sizes: counters.batch_sizes,
            queue_latency: counters.queue_latency,
            completed_requests: counters.completed,
            rejected_requests: counters.rejected,
            cancelled_requests: counters.cancelled,
            expired_requests: counters.expired,
            instances: self.dispatcher.stats(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::{
            Device, DynamicBatching, InstanceGroup, Scheduling, SequenceBatching, TimeoutPolicy,
        },
        instance::InstanceState,
        model::{tagged, FakeBackend},
        request::{CorrelationId, Response},
    };
    use serial_test::serial;

    const WAIT: Duration = Duration::from_secs(2);

    fn dynamic(max_batch_size: usize, delay_ms: u64) -> ModelConfig {
        ModelConfig::new("fake")
            .max_batch_size(max_batch_size)
            .scheduling(Scheduling::Dynamic(
                DynamicBatching::new().max_queue_delay(Duration::from_millis(delay_ms)),
            ))
    }

    fn sequence(instances: usize) -> ModelConfig {
        ModelConfig::new("fake")
            .max_batch_size(4)
            .instance_groups(vec![InstanceGroup::new(instances, Device::Cpu)])
            .scheduling(Scheduling::Sequence(
                SequenceBatching::new().idle_timeout(Duration::from_millis(30)),
            ))
    }

    // one instance; steps are cut 1ms after arrival even while it is busy
    fn delayed_sequence() -> ModelConfig {
        sequence(1).scheduling(Scheduling::Sequence(
            SequenceBatching::new()
                .idle_timeout(Duration::from_millis(30))
                .batching(DynamicBatching::new().max_queue_delay(Duration::from_millis(1))),
        ))
    }

    fn step(tag: u8, correlation_id: CorrelationId, start: bool, end: bool) -> InferRequest {
        tagged("fake", tag).sequence(correlation_id, start, end)
    }

    #[test]
    #[serial]
    fn test_batches_cut_on_size_then_delay() {
        let backend = FakeBackend::new();
        let scheduler = Scheduler::start(dynamic(4, 10), backend.factory(), None).unwrap();
        let mut tickets = vec![];
        for tag in 0..4 {
            tickets.push(scheduler.enqueue(tagged("fake", tag)).unwrap());
        }
        thread::sleep(Duration::from_millis(1));
        let tail_arrival = Instant::now();
        for tag in 4..6 {
            tickets.push(scheduler.enqueue(tagged("fake", tag)).unwrap());
        }
        let responses: Vec<_> = tickets.iter().map(|t| t.recv().unwrap()).collect();
        let rows: Vec<_> = responses.iter().map(|r| r.batch_rows).collect();
        assert_eq!(rows, vec![4, 4, 4, 4, 2, 2]);
        let executions = backend.executions();
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].tags, vec![0, 1, 2, 3]);
        assert_eq!(executions[1].tags, vec![4, 5]);
        assert!(executions[1].started >= tail_arrival + Duration::from_millis(10));
        assert!(responses[4].queue_time >= Duration::from_millis(10));
        let stats = scheduler.stats().unwrap();
        assert_eq!(stats.batch_sizes.get(&4), Some(&1));
        assert_eq!(stats.batch_sizes.get(&2), Some(&1));
        assert_eq!(stats.queue_latency.count, 6);
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_unload_drains_queued_work() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let scheduler =
            Scheduler::start(ModelConfig::new("fake"), backend.factory(), None).unwrap();
        // direct scheduling: the first request is dispatched before the next
        // enqueue is handled
        let tickets: Vec<_> = (0..4)
            .map(|tag| scheduler.enqueue(tagged("fake", tag)).unwrap())
            .collect();
        let drain = scheduler.unload();
        assert!(!scheduler.is_servable());
        assert_eq!(
            scheduler.enqueue(tagged("fake", 9)).unwrap_err(),
            Error::ModelUnavailable("fake:1".to_string())
        );
        assert!(!drain.wait_timeout(Duration::from_millis(20)));
        assert!(!drain.is_done());
        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        for ticket in &tickets {
            assert!(ticket.recv().is_ok());
        }
        assert!(drain.wait_timeout(WAIT));
        let tags: Vec<_> = backend.executions().iter().map(|e| e.tags[0]).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
        assert_eq!(backend.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().unwrap_err(), Error::Disconnected);
    }

    #[test]
    #[serial]
    fn test_sequences_spread_and_stay_pinned() {
        let backend = FakeBackend::new();
        let scheduler = Scheduler::start(sequence(2), backend.factory(), None).unwrap();
        let a = scheduler.enqueue(step(10, 1, true, false)).unwrap();
        let b = scheduler.enqueue(step(20, 2, true, false)).unwrap();
        let a0 = a.recv().unwrap();
        let b0 = b.recv().unwrap();
        assert_eq!(a0.instance, 0);
        assert_eq!(b0.instance, 1);
        assert_eq!(a0.sequence_step, Some(0));
        let rest: Vec<_> = vec![
            scheduler.enqueue(step(11, 1, false, false)).unwrap(),
            scheduler.enqueue(step(12, 1, false, true)).unwrap(),
            scheduler.enqueue(step(21, 2, false, true)).unwrap(),
        ];
        let responses: Vec<_> = rest.iter().map(|t| t.recv().unwrap()).collect();
        assert_eq!(responses[0].instance, 0);
        assert_eq!(responses[1].instance, 0);
        assert_eq!(responses[1].sequence_step, Some(2));
        assert_eq!(responses[2].instance, 1);
        // steps of one sequence executed in order
        let a_tags: Vec<_> = backend
            .executions()
            .iter()
            .flat_map(|e| e.tags.clone())
            .filter(|&tag| tag / 10 == 1)
            .collect();
        assert_eq!(a_tags, vec![10, 11, 12]);
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_sequence_steps_never_share_a_batch() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let scheduler = Scheduler::start(sequence(1), backend.factory(), None).unwrap();
        let tickets = vec![
            scheduler.enqueue(step(10, 1, true, false)).unwrap(),
            scheduler.enqueue(step(11, 1, false, false)).unwrap(),
            scheduler.enqueue(step(20, 2, true, false)).unwrap(),
            scheduler.enqueue(step(12, 1, false, true)).unwrap(),
        ];
        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        for ticket in &tickets {
            assert!(ticket.recv().is_ok());
        }
        let batches: Vec<_> = backend.executions().into_iter().map(|e| e.tags).collect();
        assert_eq!(batches, vec![vec![10], vec![11, 20], vec![12]]);
        // sequence 2 never ended; the drain releases it
        assert!(scheduler.unload().wait_timeout(WAIT));
    }

    #[test]
    #[serial]
    fn test_sequence_timeout() {
        let backend = FakeBackend::new();
        let scheduler = Scheduler::start(sequence(1), backend.factory(), None).unwrap();
        scheduler
            .enqueue(step(1, 9, true, false))
            .unwrap()
            .recv()
            .unwrap();
        assert_eq!(scheduler.stats().unwrap().active_sequences, 1);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(scheduler.stats().unwrap().active_sequences, 0);
        assert_eq!(
            scheduler.enqueue(step(2, 9, false, false)).unwrap_err(),
            Error::SequenceTimeout(9)
        );
        assert!(scheduler.enqueue(step(3, 9, true, true)).unwrap().recv().is_ok());
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_sequence_restart_policy() {
        let backend = FakeBackend::new();
        let config = sequence(1).scheduling(Scheduling::Sequence(
            SequenceBatching::new()
                .idle_timeout(Duration::from_millis(20))
                .timeout_policy(TimeoutPolicy::Restart),
        ));
        let scheduler = Scheduler::start(config, backend.factory(), None).unwrap();
        scheduler
            .enqueue(step(1, 9, true, false))
            .unwrap()
            .recv()
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        let restarted = scheduler.enqueue(step(2, 9, false, false)).unwrap();
        assert_eq!(restarted.recv().unwrap().sequence_step, Some(0));
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_cancel() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let scheduler =
            Scheduler::start(ModelConfig::new("fake"), backend.factory(), None).unwrap();
        let running = scheduler.enqueue(tagged("fake", 0)).unwrap();
        let queued = scheduler.enqueue(tagged("fake", 1)).unwrap();
        assert_eq!(queued.cancel(), Ok(()));
        assert_eq!(queued.recv(), Err(Error::Cancelled(queued.id())));
        assert_eq!(
            running.cancel(),
            Err(Error::AlreadyDispatched(running.id()))
        );
        assert_eq!(queued.cancel(), Err(Error::RequestNotFound(queued.id())));
        gate.send(()).unwrap();
        assert!(running.recv().is_ok());
        let stats = scheduler.stats().unwrap();
        assert_eq!(stats.cancelled_requests, 1);
        assert_eq!(backend.executions().len(), 1);
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_queue_overflow() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let config = ModelConfig::new("fake").max_queue_size(Some(2));
        let scheduler = Scheduler::start(config, backend.factory(), None).unwrap();
        let tickets: Vec<_> = (0..3)
            .map(|tag| scheduler.enqueue(tagged("fake", tag)).unwrap())
            .collect();
        assert_eq!(
            scheduler.enqueue(tagged("fake", 3)).unwrap_err(),
            Error::QueueOverflow { capacity: 2 }
        );
        assert_eq!(scheduler.stats().unwrap().rejected_requests, 1);
        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        for ticket in &tickets {
            assert!(ticket.recv().is_ok());
        }
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_priority_order() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let scheduler =
            Scheduler::start(ModelConfig::new("fake"), backend.factory(), None).unwrap();
        let tickets = vec![
            scheduler.enqueue(tagged("fake", 0)).unwrap(),
            scheduler.enqueue(tagged("fake", 1)).unwrap(),
            scheduler.enqueue(tagged("fake", 2).priority(5)).unwrap(),
            scheduler.enqueue(tagged("fake", 3)).unwrap(),
        ];
        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        for ticket in &tickets {
            assert!(ticket.recv().is_ok());
        }
        let tags: Vec<_> = backend.executions().iter().map(|e| e.tags[0]).collect();
        assert_eq!(tags, vec![0, 2, 1, 3]);
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_deadline_exceeded_at_cut() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let scheduler =
            Scheduler::start(ModelConfig::new("fake"), backend.factory(), None).unwrap();
        let running = scheduler.enqueue(tagged("fake", 0)).unwrap();
        let late = scheduler
            .enqueue(tagged("fake", 1).timeout(Duration::from_millis(1)))
            .unwrap();
        thread::sleep(Duration::from_millis(10));
        gate.send(()).unwrap();
        assert!(running.recv().is_ok());
        assert_eq!(late.recv(), Err(Error::DeadlineExceeded(late.id())));
        assert_eq!(backend.executions().len(), 1);
        assert_eq!(scheduler.stats().unwrap().expired_requests, 1);
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_invalid_requests() {
        let backend = FakeBackend::new();
        let scheduler = Scheduler::start(dynamic(4, 1), backend.factory(), None).unwrap();
        assert!(matches!(
            scheduler.enqueue(tagged("fake", 0).batch_size(5)),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            scheduler.enqueue(tagged("fake", 0).batch_size(0)),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            scheduler.enqueue(tagged("fake", 0).sequence(3, true, false)),
            Err(Error::SequenceConflict {
                correlation_id: 3,
                ..
            })
        ));
        assert_eq!(
            scheduler.enqueue(tagged("other", 0)).unwrap_err(),
            Error::ModelUnavailable("other:latest".to_string())
        );
        assert_eq!(
            scheduler.enqueue(tagged("fake", 0).version(2)).unwrap_err(),
            Error::ModelUnavailable("fake:2".to_string())
        );
        let rows = scheduler.enqueue(tagged("fake", 0).batch_size(3)).unwrap();
        assert_eq!(rows.recv().unwrap().batch_rows, 3);
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_health_events() {
        let backend = FakeBackend::new();
        backend.batch_failures.store(2, Ordering::SeqCst);
        let (health_tx, health_rx) = channel::unbounded();
        let config = ModelConfig::new("fake").unhealthy_threshold(2);
        let scheduler = Scheduler::start(config, backend.factory(), Some(health_tx)).unwrap();
        for tag in 0..3 {
            let _ = scheduler.enqueue(tagged("fake", tag)).unwrap().recv();
        }
        // the finish report may trail the response
        let unhealthy = health_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(
            unhealthy,
            HealthEvent::Unhealthy {
                model: "fake:1".to_string(),
                instance: 0,
                consecutive_failures: 2
            }
        );
        assert_eq!(
            health_rx.recv_timeout(WAIT).unwrap(),
            HealthEvent::Recovered {
                model: "fake:1".to_string(),
                instance: 0
            }
        );
        scheduler.unload().wait();
    }

    #[test]
    #[serial]
    fn test_load_failures() {
        let backend = FakeBackend::new();
        backend.load_failures.store(1, Ordering::SeqCst);
        let (health_tx, health_rx) = channel::unbounded();
        let config = ModelConfig::new("fake")
            .instance_groups(vec![InstanceGroup::new(2, Device::Gpu(0))]);
        let scheduler = Scheduler::start(config, backend.factory(), Some(health_tx)).unwrap();
        assert!(matches!(
            health_rx.try_recv().unwrap(),
            HealthEvent::LoadFailed { .. }
        ));
        let states: Vec<_> = scheduler
            .stats()
            .unwrap()
            .instances
            .iter()
            .map(|stat| stat.state)
            .collect();
        assert!(states.contains(&InstanceState::LoadFailed));
        assert!(states.contains(&InstanceState::Idle));
        assert!(scheduler.enqueue(tagged("fake", 0)).unwrap().recv().is_ok());
        scheduler.unload().wait();

        backend.load_failures.store(1, Ordering::SeqCst);
        assert_eq!(
            Scheduler::start(ModelConfig::new("fake"), backend.factory(), None).err(),
            Some(Error::LoadFailed("fake:1: no instance loaded".to_string()))
        );
        assert!(matches!(
            Scheduler::start(ModelConfig::new(""), backend.factory(), None),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    #[serial]
    fn test_reused_correlation_id_stays_pinned() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let scheduler = Scheduler::start(delayed_sequence(), backend.factory(), None).unwrap();
        let first = scheduler.enqueue(step(1, 1, true, true)).unwrap();
        // the end step is cut and executing, so id 1 is free again
        thread::sleep(Duration::from_millis(10));
        let restarted = scheduler.enqueue(step(2, 1, true, false)).unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(scheduler.stats().unwrap().ready_batches, 1);
        gate.send(()).unwrap();
        assert_eq!(first.recv().unwrap().sequence_step, Some(0));
        // the restarted step now executes for longer than the idle timeout
        thread::sleep(Duration::from_millis(80));
        let stats = scheduler.stats().unwrap();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.active_sequences, 1);
        let next = scheduler.enqueue(step(3, 1, false, true)).unwrap();
        gate.send(()).unwrap();
        gate.send(()).unwrap();
        assert_eq!(restarted.recv().unwrap().sequence_step, Some(0));
        assert_eq!(next.recv().unwrap().sequence_step, Some(1));
        assert!(scheduler.unload().wait_timeout(WAIT));
    }

    #[test]
    #[serial]
    fn test_cancel_cut_step_behind_busy_instance() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let scheduler = Scheduler::start(delayed_sequence(), backend.factory(), None).unwrap();
        let running = scheduler.enqueue(step(10, 1, true, false)).unwrap();
        thread::sleep(Duration::from_millis(10));
        let waiting = scheduler.enqueue(step(20, 2, true, false)).unwrap();
        thread::sleep(Duration::from_millis(10));
        let stats = scheduler.stats().unwrap();
        assert_eq!(stats.ready_batches, 1);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(waiting.cancel(), Ok(()));
        assert_eq!(waiting.recv(), Err(Error::Cancelled(waiting.id())));
        let stats = scheduler.stats().unwrap();
        assert_eq!(stats.ready_batches, 0);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.active_sequences, 2);
        assert_eq!(stats.cancelled_requests, 1);
        // sequence 2 is idle again and times out; sequence 1 is executing
        thread::sleep(Duration::from_millis(80));
        assert_eq!(scheduler.stats().unwrap().active_sequences, 1);
        assert_eq!(
            scheduler.enqueue(step(21, 2, false, false)).unwrap_err(),
            Error::SequenceTimeout(2)
        );
        gate.send(()).unwrap();
        assert_eq!(running.recv().unwrap().sequence_step, Some(0));
        let drain = scheduler.unload();
        assert!(drain.wait_timeout(WAIT));
        assert!(drain.is_done());
        assert_eq!(backend.executions().len(), 1);
    }

    fn submit(
        core: &mut Core,
        id: RequestId,
        request: InferRequest,
    ) -> channel::Receiver<Response> {
        let (pending, response_rx) = Pending::new(id, request);
        let (reply_tx, reply_rx) = channel::bounded(1);
        core.handle(Command::Enqueue(pending, reply_tx));
        assert_eq!(reply_rx.recv().unwrap(), Ok(()));
        response_rx
    }

    #[test]
    #[serial]
    fn test_lost_worker_fails_pinned_steps() {
        let mut backend = FakeBackend::new();
        let gate = backend.gated();
        let (tx, rx) = channel::unbounded();
        let executor = Executor::spawn("fake:1", 0, Device::Cpu, backend.factory(), tx).unwrap();
        let mut instance = Instance::new(0, Device::Cpu, executor);
        match rx.recv_timeout(WAIT).unwrap() {
            Command::InstanceLoaded(_, result) => instance.loaded(result),
            _ => panic!("unexpected command"),
        }
        let servable = Arc::new(AtomicBool::new(true));
        let dispatcher = Dispatcher::new(vec![instance]);
        let mut core = Core::new(delayed_sequence(), dispatcher, None, servable.clone());
        let first = submit(&mut core, 0, step(1, 1, true, false));
        core.schedule(Instant::now() + Duration::from_millis(5));
        assert_eq!(core.in_flight.len(), 1);
        // nobody hears the report, so the worker exits after this batch
        drop(rx);
        gate.send(()).unwrap();
        assert!(first.recv().unwrap().is_ok());
        while backend.unloads.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        core.finish(
            0,
            Report {
                batch_id: 0,
                requests: vec![(0, Some((1, 0)))],
                rows: 1,
                failed: false,
                elapsed: Duration::new(0, 0),
            },
        );
        let second = submit(&mut core, 1, step(2, 1, false, false));
        core.schedule(Instant::now() + Duration::from_millis(5));
        assert!(matches!(
            second.recv().unwrap(),
            Err(Error::ExecutionFailed(_))
        ));
        assert!(!servable.load(Ordering::SeqCst));
        let stats = core.stats();
        assert!(!stats.servable);
        assert_eq!(stats.active_sequences, 0);
        assert_eq!(stats.ready_batches, 0);
        assert!(matches!(
            core.admit(Pending::new(2, step(3, 2, true, false)).0),
            Err(Error::ModelUnavailable(_))
        ));
        let (done_tx, done_rx) = channel::bounded(1);
        core.handle(Command::Unload(done_tx));
        assert!(core.finish_drain());
        assert!(done_rx.try_recv().is_ok());
    }
}
