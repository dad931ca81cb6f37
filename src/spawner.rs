//! Spawning of per-request streaming tasks.
//!
//! Server mode hands every remote request to its own task. The `TaskSpawner`
//! seam keeps the dispatch loop independent of how tasks are run; the only
//! implementation today runs one OS thread per in-flight request, which caps
//! scalability at the number of threads the host tolerates.

use crate::error::{Result, SutError};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use tracing::warn;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, name: String, task: Task) -> Result<()>;

    /// Waits for every task spawned so far and returns the names of the
    /// tasks that panicked since the last call.
    fn join_all(&self) -> Vec<String>;

    fn in_flight(&self) -> usize;
}

#[derive(Default)]
pub struct ThreadPerRequest {
    handles: Mutex<Vec<JoinHandle<()>>>,
    panicked: Mutex<Vec<String>>,
}

impl ThreadPerRequest {
    pub fn new() -> Self {
        Self::default()
    }

    fn reap(&self, handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            let name = handle.thread().name().unwrap_or("task").to_string();
            if handle.join().is_err() {
                warn!("{name} panicked");
                self.panicked.lock().push(name);
            }
        }
    }
}

impl TaskSpawner for ThreadPerRequest {
    fn spawn(&self, name: String, task: Task) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(task)
            .map_err(SutError::from)?;
        let finished = {
            let mut handles = self.handles.lock();
            let (finished, running): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(|handle| handle.is_finished());
            *handles = running;
            handles.push(handle);
            finished
        };
        self.reap(finished);
        Ok(())
    }

    fn join_all(&self) -> Vec<String> {
        let handles = std::mem::take(&mut *self.handles.lock());
        self.reap(handles);
        std::mem::take(&mut *self.panicked.lock())
    }

    fn in_flight(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}
