//! Request identity and the units of work that flow through the queue.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned by the benchmark driver, echoed verbatim in every report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResponseId(pub u64);

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: ResponseId,
    /// Sample index into the driver's sample store.
    pub index: usize,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl Request {
    /// Builds a request whose attention mask covers every input token.
    pub fn new(id: ResponseId, index: usize, input_ids: Vec<u32>) -> Self {
        let attention_mask = vec![1; input_ids.len()];
        Self {
            id,
            index,
            input_ids,
            attention_mask,
        }
    }

    pub fn input_len(&self) -> usize {
        self.input_ids.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkUnit {
    Batch(Vec<Request>),
    Single(Request),
}

impl WorkUnit {
    pub fn len(&self) -> usize {
        match self {
            WorkUnit::Batch(requests) => requests.len(),
            WorkUnit::Single(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn requests(&self) -> &[Request] {
        match self {
            WorkUnit::Batch(requests) => requests,
            WorkUnit::Single(request) => std::slice::from_ref(request),
        }
    }

    pub fn into_requests(self) -> Vec<Request> {
        match self {
            WorkUnit::Batch(requests) => requests,
            WorkUnit::Single(request) => vec![request],
        }
    }
}

/// Final output of one request, reported exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenResult {
    pub id: ResponseId,
    pub tokens: Vec<u32>,
}

impl TokenResult {
    pub fn new(id: ResponseId, tokens: Vec<u32>) -> Self {
        Self { id, tokens }
    }

    /// The completion payload handed to the driver.
    pub fn encode(&self) -> Vec<u8> {
        encode_token_ids(&self.tokens)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirstTokenEvent {
    pub token: u32,
    pub id: ResponseId,
}

/// Encodes token ids as the driver expects them: one little-endian `i32` each.
pub fn encode_token_ids(tokens: &[u32]) -> Vec<u8> {
    tokens
        .iter()
        .flat_map(|token| (*token as i32).to_le_bytes())
        .collect()
}

pub fn decode_token_ids(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u32)
        .collect()
}
