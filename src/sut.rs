//! The system under test as seen by the benchmark driver.
//!
//! `Sut::start` spins up the worker pool (and, in server mode, the first-token
//! relay); the driver then calls `submit` as queries arrive and `shutdown`
//! once the run is over.

use crate::backend::Backend;
use crate::cache::OutputCache;
use crate::config::{Mode, SutConfig};
use crate::dispatch::{run_worker, Dispatcher};
use crate::error::{Result, SutError};
use crate::queue::WorkQueue;
use crate::relay::FirstTokenRelay;
use crate::report::{CompletionSink, ProgressObserver};
use crate::request::{Request, WorkUnit};
use crate::spawner::{TaskSpawner, ThreadPerRequest};
use itertools::Itertools;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Splits an issued query set into consecutive batches of at most `batch_size`.
pub fn slice_batches(requests: Vec<Request>, batch_size: usize) -> Vec<Vec<Request>> {
    let chunks = requests.into_iter().chunks(batch_size.max(1));
    chunks.into_iter().map(|chunk| chunk.collect()).collect()
}

pub struct Sut {
    dispatcher: Arc<Dispatcher>,
    queue: WorkQueue<WorkUnit>,
    workers: Vec<JoinHandle<()>>,
    relay: Option<FirstTokenRelay>,
    mode: Mode,
    batch_size: usize,
    stopped: bool,
}

impl Sut {
    pub fn start(
        config: SutConfig,
        backend: Backend,
        sink: Arc<dyn CompletionSink>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<Self> {
        Self::start_with_spawner(config, backend, sink, observer, Arc::new(ThreadPerRequest::new()))
    }

    pub fn start_with_spawner(
        config: SutConfig,
        backend: Backend,
        sink: Arc<dyn CompletionSink>,
        observer: Arc<dyn ProgressObserver>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Result<Self> {
        config.validate()?;
        let expected = config.protocol()?;
        if backend.protocol() != expected {
            return Err(SutError::config(format!(
                "backend speaks {:?} but the configuration asks for {:?}",
                backend.protocol(),
                expected
            )));
        }

        let relay = match config.mode {
            Mode::Server => Some(FirstTokenRelay::start(sink.clone())?),
            Mode::Offline => None,
        };
        let cache = config
            .use_cached_outputs
            .then(|| OutputCache::new(config.cache_dir.clone()));
        let mode = config.mode;
        let batch_size = config.batch_size();
        let num_workers = config.workers;
        info!(
            "starting {num_workers} {mode:?} workers over {} endpoint(s), batch size {batch_size}",
            backend.endpoint_count()
        );

        let dispatcher = Arc::new(Dispatcher::new(
            config,
            backend,
            sink,
            observer,
            cache,
            relay.as_ref().map(FirstTokenRelay::sender),
            spawner,
        ));
        let queue = WorkQueue::new();
        let mut sut = Self {
            dispatcher,
            queue,
            workers: Vec::with_capacity(num_workers),
            relay,
            mode,
            batch_size,
            stopped: false,
        };
        for worker in 0..num_workers {
            let dispatcher = Arc::clone(&sut.dispatcher);
            let queue = sut.queue.clone();
            let spawned = thread::Builder::new()
                .name(format!("sut-worker-{worker}"))
                .spawn(move || run_worker(dispatcher, queue, worker));
            match spawned {
                Ok(handle) => sut.workers.push(handle),
                Err(err) => {
                    let _ = sut.shutdown();
                    return Err(err.into());
                }
            }
        }
        Ok(sut)
    }

    /// Enqueues an issued query set: batches of `batch_size` in offline mode,
    /// one unit per request in server mode.
    pub fn submit(&self, requests: Vec<Request>) -> Result<()> {
        if self.stopped {
            return Err(SutError::Disconnected);
        }
        match self.mode {
            Mode::Offline => {
                for batch in slice_batches(requests, self.batch_size) {
                    self.queue.push(WorkUnit::Batch(batch))?;
                }
            }
            Mode::Server => {
                for request in requests {
                    self.queue.push(WorkUnit::Single(request))?;
                }
            }
        }
        Ok(())
    }

    /// Nothing is buffered outside the queue.
    pub fn flush(&self) {}

    pub fn completed_samples(&self) -> usize {
        self.dispatcher.completed_samples()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stops the pool, waits for in-flight requests and the relay, and returns
    /// the first fatal error any worker or task hit.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.queue.push_sentinels(self.workers.len())?;
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                self.dispatcher
                    .record_fatal("shutdown", SutError::Panicked(name));
            }
        }
        for name in self.dispatcher.spawner.join_all() {
            self.dispatcher
                .record_fatal("shutdown", SutError::Panicked(name));
        }
        if let Some(mut relay) = self.relay.take() {
            if let Err(err) = relay.stop() {
                self.dispatcher.record_fatal("shutdown", err);
            }
        }

        let leftover = self.queue.drain();
        if !leftover.is_empty() {
            warn!(
                "{} queued units were never processed",
                leftover.len()
            );
        }
        info!("SUT stopped after {} samples", self.completed_samples());
        match self.dispatcher.take_fatal() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Sut {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("shutdown on drop: {err}");
        }
    }
}
