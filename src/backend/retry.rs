use crate::error::{Result, SutError};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// How often a backend call is repeated on transient failures.
///
/// `max_attempts: None` retries forever, which is what benchmark runs on a
/// controlled network want. Bound it for anything else.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff_ms: 0,
        }
    }

    #[must_use]
    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// Runs `call` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub fn run<T>(&self, label: &str, mut call: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(SutError::RetriesExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }
                    warn!("{label}: connection failure on attempt {attempt} ({err}), retrying");
                    if self.backoff_ms > 0 {
                        thread::sleep(Duration::from_millis(self.backoff_ms));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_success() {
        let mut calls = 0;
        let value = RetryPolicy::unlimited()
            .run("test", || {
                calls += 1;
                if calls < 3 {
                    Err(SutError::Transport("refused".to_string()))
                } else {
                    Ok(calls)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn bounded_policy_gives_up() {
        let mut calls = 0;
        let err = RetryPolicy::bounded(2)
            .run("test", || -> Result<()> {
                calls += 1;
                Err(SutError::Transport("refused".to_string()))
            })
            .unwrap_err();
        assert_eq!(calls, 2);
        assert!(matches!(err, SutError::RetriesExhausted { attempts: 2, .. }));
    }

    #[test]
    fn malformed_is_not_retried() {
        let mut calls = 0;
        let err = RetryPolicy::unlimited()
            .run("test", || -> Result<()> {
                calls += 1;
                Err(SutError::malformed("no choices"))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, SutError::MalformedResponse(_)));
    }
}
