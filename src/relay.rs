//! Out-of-band first-token reporting for server mode.
//!
//! Backends push `FirstTokenEvent`s into the relay queue as soon as the first
//! generated token is known. A single consumer thread turns each event into a
//! partial completion. Every event carries an acknowledgement channel so the
//! task that produced it can hold back its final completion until the
//! partial one has been issued.

use crate::error::{Result, SutError};
use crate::queue::{QueueItem, WorkQueue};
use crate::report::CompletionSink;
use crate::request::{encode_token_ids, FirstTokenEvent, ResponseId};
use flume::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

struct RelayItem {
    event: FirstTokenEvent,
    reported: Sender<()>,
}

#[derive(Clone)]
pub struct FirstTokenSender {
    queue: WorkQueue<RelayItem>,
}

impl FirstTokenSender {
    /// Emitter for one request. Only its first `emit` reaches the relay.
    pub fn emitter(&self, id: ResponseId) -> FirstTokenEmitter {
        FirstTokenEmitter {
            id,
            sender: Some(self.clone()),
            token: None,
            receipt: None,
        }
    }

    fn send(&self, event: FirstTokenEvent) -> Result<Receiver<()>> {
        let (reported, receipt) = flume::bounded(1);
        self.queue.push(RelayItem { event, reported })?;
        Ok(receipt)
    }
}

pub struct FirstTokenEmitter {
    id: ResponseId,
    sender: Option<FirstTokenSender>,
    token: Option<u32>,
    receipt: Option<Receiver<()>>,
}

impl FirstTokenEmitter {
    /// Emitter that records the first token without reporting it anywhere.
    pub fn detached(id: ResponseId) -> Self {
        Self {
            id,
            sender: None,
            token: None,
            receipt: None,
        }
    }

    pub fn id(&self) -> ResponseId {
        self.id
    }

    /// Returns `true` when this call produced the request's first-token event.
    pub fn emit(&mut self, token: u32) -> Result<bool> {
        if self.token.is_some() {
            return Ok(false);
        }
        self.token = Some(token);
        if let Some(sender) = &self.sender {
            self.receipt = Some(sender.send(FirstTokenEvent { token, id: self.id })?);
        }
        Ok(true)
    }

    pub fn token(&self) -> Option<u32> {
        self.token
    }

    /// Blocks until the relay has reported the emitted token, if any.
    pub fn wait_reported(&mut self) {
        if let Some(receipt) = self.receipt.take() {
            // A disconnected receipt means the relay already stopped.
            let _ = receipt.recv();
        }
    }
}

pub struct FirstTokenRelay {
    queue: WorkQueue<RelayItem>,
    handle: Option<JoinHandle<()>>,
}

impl FirstTokenRelay {
    pub fn start(sink: Arc<dyn CompletionSink>) -> Result<Self> {
        let queue = WorkQueue::new();
        let consumer = queue.clone();
        let handle = thread::Builder::new()
            .name("first-token-relay".to_string())
            .spawn(move || run_relay(consumer, sink))?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> FirstTokenSender {
        FirstTokenSender {
            queue: self.queue.clone(),
        }
    }

    /// Enqueues the sentinel and waits for the relay thread to exit.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.queue.push_sentinels(1)?;
        handle
            .join()
            .map_err(|_| SutError::Panicked("first-token relay".to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for FirstTokenRelay {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_relay(queue: WorkQueue<RelayItem>, sink: Arc<dyn CompletionSink>) {
    loop {
        let item = match queue.pop() {
            Ok(QueueItem::Work(item)) => item,
            Ok(QueueItem::Sentinel) | Err(_) => break,
        };
        let RelayItem { event, reported } = item;
        debug!("first token {} for request {}", event.token, event.id);
        sink.complete_first_token(event.id, &encode_token_ids(&[event.token]));
        let _ = reported.send(());
    }
    info!("Exiting first token response thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::decode_token_ids;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        first: Mutex<Vec<(ResponseId, Vec<u32>)>>,
    }

    impl CompletionSink for Recorder {
        fn complete(&self, _id: ResponseId, _data: &[u8], _n_tokens: usize) {}

        fn complete_first_token(&self, id: ResponseId, data: &[u8]) {
            self.first.lock().push((id, decode_token_ids(data)));
        }
    }

    #[test]
    fn emits_once_per_request() {
        let recorder = Arc::new(Recorder::default());
        let mut relay = FirstTokenRelay::start(recorder.clone()).unwrap();
        let mut emitter = relay.sender().emitter(ResponseId(9));

        assert!(emitter.emit(42).unwrap());
        assert!(!emitter.emit(43).unwrap());
        emitter.wait_reported();

        assert_eq!(recorder.first.lock().clone(), vec![(ResponseId(9), vec![42])]);
        assert_eq!(emitter.token(), Some(42));
        relay.stop().unwrap();
        assert!(!relay.is_running());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut relay = FirstTokenRelay::start(Arc::new(Recorder::default())).unwrap();
        relay.stop().unwrap();
        relay.stop().unwrap();
    }

    #[test]
    fn detached_emitter_only_records() {
        let mut emitter = FirstTokenEmitter::detached(ResponseId(1));
        assert!(emitter.emit(5).unwrap());
        emitter.wait_reported();
        assert_eq!(emitter.token(), Some(5));
    }
}
