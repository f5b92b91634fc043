use crate::{
    config::Device,
    error::Error,
    instance::InstanceId,
    model::{Batch, BatchOutput, Inference, ModelFactory},
    request::{InferResponse, Pending, RequestId, SequenceRef, Tensor},
    scheduler::Command,
};
use crossbeam::channel;
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};

/// What an executor tells the scheduler after a batch.
#[derive(Debug)]
pub(crate) struct Report {
    pub batch_id: u64,
    pub requests: Vec<(RequestId, Option<SequenceRef>)>,
    pub rows: usize,
    pub failed: bool,
    pub elapsed: Duration,
}

/// Worker thread of one instance. It builds the backend, then runs batches
/// one at a time and sends every member its completion before reporting back.
pub(crate) struct Executor {
    jobs: channel::Sender<Batch>,
    thread: thread::JoinHandle<()>,
}

impl Executor {
    pub fn spawn(
        model_key: &str,
        instance: InstanceId,
        device: Device,
        factory: ModelFactory,
        notify: channel::Sender<Command>,
    ) -> io::Result<Self> {
        let (jobs, job_rx) = channel::unbounded::<Batch>();
        let thread = thread::Builder::new()
            .name(format!("{}#{}", model_key, instance))
            .spawn(move || {
                let loaded = panic::catch_unwind(AssertUnwindSafe(|| factory(&device)))
                    .unwrap_or_else(|_| Err("backend panicked while loading".to_string()));
                let model = match loaded {
                    Ok(model) => {
                        let _ = notify.send(Command::InstanceLoaded(instance, Ok(())));
                        model
                    }
                    Err(reason) => {
                        let _ = notify.send(Command::InstanceLoaded(instance, Err(reason)));
                        return;
                    }
                };
                for batch in job_rx.iter() {
                    let report = execute(model.as_ref(), instance, device, batch);
                    if notify.send(Command::ExecutorFinish(instance, report)).is_err() {
                        break;
                    }
                }
                model.unload();
            })?;
        Ok(Executor { jobs, thread })
    }

    /// Hand a batch to the worker; gives it back if the worker is gone.
    pub fn run(&self, batch: Batch) -> Result<(), Batch> {
        self.jobs.send(batch).map_err(|err| err.into_inner())
    }

    /// Close the job channel and wait for the backend to be released.
    pub fn shutdown(self) {
        drop(self.jobs);
        if self.thread.join().is_err() {
            log::error!("instance worker panicked during shutdown");
        }
    }
}

fn execute(model: &dyn Inference, instance: InstanceId, device: Device, batch: Batch) -> Report {
    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| model.execute(&batch)))
        .unwrap_or_else(|_| Err("backend panicked".to_string()));
    let elapsed = start.elapsed();
    let batch_id = batch.id();
    let rows = batch.rows();
    let requests = batch
        .pending()
        .iter()
        .map(|pending| (pending.id, pending.sequence_ref()))
        .collect();
    let failed = demux(batch, result, instance, device, start);
    if failed {
        log::warn!("batch {} failed on instance {}", batch_id, instance);
    }
    Report {
        batch_id,
        requests,
        rows,
        failed,
        elapsed,
    }
}

/// Split one batch result into per-request completions, in input order.
/// Returns true when the batch failed as a whole.
fn demux(
    batch: Batch,
    result: Result<BatchOutput, String>,
    instance: InstanceId,
    device: Device,
    start: Instant,
) -> bool {
    let rows = batch.rows();
    let len = batch.len();
    let members = batch.into_pending();
    let outcomes: Vec<Result<Vec<Tensor>, Error>> = match result {
        Err(reason) => return fail_all(members, &reason),
        Ok(BatchOutput::Batched(outputs)) if outputs.len() == len => {
            outputs.into_iter().map(Ok).collect()
        }
        Ok(BatchOutput::PerRequest(results)) if results.len() == len => results
            .into_iter()
            .map(|result| result.map_err(Error::ExecutionFailed))
            .collect(),
        Ok(output) => {
            let returned = match &output {
                BatchOutput::Batched(outputs) => outputs.len(),
                BatchOutput::PerRequest(results) => results.len(),
            };
            let reason = format!("backend returned {} results for {} requests", returned, len);
            return fail_all(members, &reason);
        }
    };
    for (pending, outcome) in members.into_iter().zip(outcomes) {
        let response = outcome.map(|outputs| InferResponse {
            request_id: pending.id,
            outputs,
            instance,
            device,
            batch_rows: rows,
            sequence_step: pending.step,
            queue_time: start.saturating_duration_since(pending.arrive_time),
        });
        pending.respond(response);
    }
    false
}

fn fail_all(members: Vec<Pending>, reason: &str) -> bool {
    for pending in members {
        pending.fail(Error::ExecutionFailed(reason.to_string()));
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{tagged, FakeBackend, FAIL_TAG};
    use crate::request::Pending;
    use std::sync::atomic::Ordering;

    fn spawn(backend: &FakeBackend) -> (Executor, channel::Receiver<Command>) {
        let (tx, rx) = channel::unbounded();
        let executor = Executor::spawn("fake:1", 0, Device::Gpu(0), backend.factory(), tx).unwrap();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Command::InstanceLoaded(0, Ok(())) => {}
            _ => panic!("instance did not load"),
        }
        (executor, rx)
    }

    fn finished(rx: &channel::Receiver<Command>) -> Report {
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Command::ExecutorFinish(0, report) => report,
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn test_executor() {
        let backend = FakeBackend::new();
        let (executor, rx) = spawn(&backend);
        let (first, first_rx) = Pending::new(0, tagged("fake", 1));
        let (second, second_rx) = Pending::new(1, tagged("fake", 2));
        assert!(executor.run(Batch::new(7, vec![first, second], None)).is_ok());
        let report = finished(&rx);
        assert_eq!(report.batch_id, 7);
        assert_eq!(report.requests, vec![(0, None), (1, None)]);
        assert!(!report.failed);
        let response = first_rx.recv().unwrap().unwrap();
        assert_eq!(response.outputs[0].data, vec![1]);
        assert_eq!(response.batch_rows, 2);
        assert_eq!(response.device, Device::Gpu(0));
        assert_eq!(second_rx.recv().unwrap().unwrap().request_id, 1);
        executor.shutdown();
        assert_eq!(backend.unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_partial_failure_fails_whole_batch() {
        let mut backend = FakeBackend::new();
        backend.short_output = true;
        let (executor, rx) = spawn(&backend);
        let (first, first_rx) = Pending::new(0, tagged("fake", 1));
        let (second, second_rx) = Pending::new(1, tagged("fake", 2));
        assert!(executor.run(Batch::new(0, vec![first, second], None)).is_ok());
        assert!(finished(&rx).failed);
        let expected = Err(Error::ExecutionFailed(
            "backend returned 1 results for 2 requests".to_string(),
        ));
        assert_eq!(first_rx.recv().unwrap(), expected);
        assert_eq!(second_rx.recv().unwrap(), expected);
        executor.shutdown();
    }

    #[test]
    fn test_per_request_status() {
        let backend = FakeBackend::new();
        let (executor, rx) = spawn(&backend);
        let (good, good_rx) = Pending::new(0, tagged("fake", 3));
        let (bad, bad_rx) = Pending::new(1, tagged("fake", FAIL_TAG));
        assert!(executor.run(Batch::new(0, vec![good, bad], None)).is_ok());
        assert!(!finished(&rx).failed);
        assert!(good_rx.recv().unwrap().is_ok());
        assert_eq!(
            bad_rx.recv().unwrap(),
            Err(Error::ExecutionFailed("rejected input".to_string()))
        );
        executor.shutdown();
    }

    #[test]
    fn test_load_failure() {
        let backend = FakeBackend::new();
        backend.load_failures.store(1, Ordering::SeqCst);
        let (tx, rx) = channel::unbounded();
        let executor = Executor::spawn("fake:1", 3, Device::Cpu, backend.factory(), tx).unwrap();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Command::InstanceLoaded(3, Err(reason)) => assert_eq!(reason, "cannot load on cpu"),
            _ => panic!("load should fail"),
        }
        executor.shutdown();
        assert_eq!(backend.unloads.load(Ordering::SeqCst), 0);
    }
}
