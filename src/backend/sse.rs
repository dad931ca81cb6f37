//! Line-oriented server-sent-event reading for streamed responses.

use crate::error::{Result, SutError};
use std::io::BufRead;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// JSON payload following `data:`.
    Data(String),
    /// The literal `[DONE]` marker.
    Done,
}

/// Classifies one line; comments, `event:` lines and blanks yield `None`.
pub fn parse_line(line: &str) -> Option<SseEvent> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(payload.to_string()))
}

pub struct SseReader<R> {
    inner: R,
    line: Vec<u8>,
}

impl<R: BufRead> SseReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    /// Next `data:` event, or `None` once the connection is closed.
    ///
    /// Read failures stay I/O errors; a line that is not UTF-8 is a
    /// malformed response.
    pub fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            self.line.clear();
            if self.inner.read_until(b'\n', &mut self.line)? == 0 {
                return Ok(None);
            }
            let line = std::str::from_utf8(&self.line)
                .map_err(|e| SutError::malformed(format!("stream line is not UTF-8: {e}")))?;
            if let Some(event) = parse_line(line) {
                return Ok(Some(event));
            }
        }
    }
}
