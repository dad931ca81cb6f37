//! Egress towards the benchmark driver: completions and progress.

use crate::request::ResponseId;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// Driver-side completion callbacks. Buffers hold little-endian `i32` token ids.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, id: ResponseId, data: &[u8], n_tokens: usize);

    /// Only called in server mode, at most once per request.
    fn complete_first_token(&self, id: ResponseId, data: &[u8]);
}

/// Completed-sample count across all workers. Progress only.
#[derive(Debug, Default)]
pub struct SampleCounter(AtomicUsize);

impl SampleCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the running total after adding `n`.
    pub fn add(&self, n: usize) -> usize {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchTimings {
    pub batch_make: Duration,
    pub inference: Duration,
    pub postprocess: Duration,
}

impl BatchTimings {
    pub fn total(&self) -> Duration {
        self.batch_make + self.inference + self.postprocess
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum UnitSource {
    Generated(BatchTimings),
    Cached(PathBuf),
    Streamed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub samples_completed: usize,
    pub unit_size: usize,
    pub source: UnitSource,
}

impl ProgressEvent {
    pub fn new(samples_completed: usize, unit_size: usize, source: UnitSource) -> Self {
        Self {
            timestamp: Utc::now(),
            samples_completed,
            unit_size,
            source,
        }
    }
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Emits every event as a structured `tracing` record.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        let at = event.timestamp.to_rfc3339();
        match &event.source {
            UnitSource::Generated(timings) => info!(
                at = %at,
                samples = event.samples_completed,
                unit = event.unit_size,
                batch_make_s = timings.batch_make.as_secs_f64(),
                inference_s = timings.inference.as_secs_f64(),
                postprocess_s = timings.postprocess.as_secs_f64(),
                total_s = timings.total().as_secs_f64(),
                "samples run"
            ),
            UnitSource::Cached(path) => info!(
                at = %at,
                samples = event.samples_completed,
                unit = event.unit_size,
                cache = %path.display(),
                "samples loaded from cache"
            ),
            UnitSource::Streamed => info!(
                at = %at,
                samples = event.samples_completed,
                "streamed sample completed"
            ),
        }
    }
}

pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::with_template("[{elapsed_precise}] {bar:60.cyan/blue} {pos:>6}/{len:6} {msg}")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressObserver for BarProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        self.bar.set_position(event.samples_completed as u64);
        if let UnitSource::Cached(path) = &event.source {
            self.bar.set_message(format!("cached {}", path.display()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let counter = SampleCounter::new();
        assert_eq!(counter.add(512), 512);
        assert_eq!(counter.add(488), 1000);
        assert_eq!(counter.get(), 1000);
    }

    #[test]
    fn timings_total() {
        let timings = BatchTimings {
            batch_make: Duration::from_millis(5),
            inference: Duration::from_millis(100),
            postprocess: Duration::from_millis(10),
        };
        assert_eq!(timings.total(), Duration::from_millis(115));
    }
}
