//! Worker loops that turn queued units into completions.
//!
//! Every worker owns nothing but a handle to the shared [`Dispatcher`]; the
//! mode decides which loop it runs.

mod offline;
mod server;

use crate::backend::Backend;
use crate::cache::OutputCache;
use crate::config::{Mode, SutConfig};
use crate::error::SutError;
use crate::queue::{QueueItem, WorkQueue};
use crate::relay::{FirstTokenEmitter, FirstTokenSender};
use crate::report::{CompletionSink, ProgressEvent, ProgressObserver, SampleCounter, UnitSource};
use crate::request::{Request, TokenResult, WorkUnit};
use crate::spawner::TaskSpawner;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

pub(crate) struct Dispatcher {
    pub(crate) config: SutConfig,
    pub(crate) backend: Backend,
    pub(crate) sink: Arc<dyn CompletionSink>,
    pub(crate) observer: Arc<dyn ProgressObserver>,
    pub(crate) counter: SampleCounter,
    pub(crate) cache: Option<OutputCache>,
    pub(crate) relay: Option<FirstTokenSender>,
    pub(crate) spawner: Arc<dyn TaskSpawner>,
    cursor: AtomicUsize,
    fatal: Mutex<Option<SutError>>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: SutConfig,
        backend: Backend,
        sink: Arc<dyn CompletionSink>,
        observer: Arc<dyn ProgressObserver>,
        cache: Option<OutputCache>,
        relay: Option<FirstTokenSender>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Self {
        Self {
            config,
            backend,
            sink,
            observer,
            counter: SampleCounter::new(),
            cache,
            relay,
            spawner,
            cursor: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        }
    }

    /// Round-robin over the endpoints, shared by every worker.
    pub(crate) fn next_endpoint(&self) -> usize {
        let count = self.backend.endpoint_count().max(1);
        self.cursor.fetch_add(1, Ordering::Relaxed) % count
    }

    pub(crate) fn emitter(&self, request: &Request) -> FirstTokenEmitter {
        match &self.relay {
            Some(sender) => sender.emitter(request.id),
            None => FirstTokenEmitter::detached(request.id),
        }
    }

    /// Reports a finished request and returns its token count.
    pub(crate) fn complete(&self, index: usize, result: &TokenResult) -> usize {
        let n_tokens = result.tokens.len();
        if n_tokens <= 1 {
            warn!(
                "caught low token count for request {} (index {index}): {:?}",
                result.id, result.tokens
            );
        }
        self.sink.complete(result.id, &result.encode(), n_tokens);
        n_tokens
    }

    pub(crate) fn progress(&self, unit_size: usize, source: UnitSource) {
        let total = self.counter.add(unit_size);
        self.observer
            .on_progress(&ProgressEvent::new(total, unit_size, source));
    }

    /// Keeps the first fatal error; later ones are only logged.
    pub(crate) fn record_fatal(&self, context: &str, err: SutError) {
        error!("{context}: {err}");
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take_fatal(&self) -> Option<SutError> {
        self.fatal.lock().take()
    }

    pub(crate) fn completed_samples(&self) -> usize {
        self.counter.get()
    }
}

/// Body of every worker thread: runs until its sentinel arrives or the
/// current unit fails fatally.
pub(crate) fn run_worker(dispatcher: Arc<Dispatcher>, queue: WorkQueue<WorkUnit>, worker: usize) {
    loop {
        let unit = match queue.pop() {
            Ok(QueueItem::Work(unit)) => unit,
            Ok(QueueItem::Sentinel) | Err(_) => break,
        };
        let outcome = match dispatcher.config.mode {
            Mode::Offline => offline::process_unit(&dispatcher, unit),
            Mode::Server => server::process_unit(&dispatcher, unit),
        };
        if let Err(err) = outcome {
            dispatcher.record_fatal(&format!("worker {worker}"), err);
            break;
        }
    }
    info!("worker {worker} exiting");
}
