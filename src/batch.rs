//! Collation of queued requests into fixed-width model inputs.

use crate::error::{Result, SutError};
use crate::request::Request;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    #[default]
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaddedBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
    /// Unpadded length of every row.
    pub input_lens: Vec<usize>,
    pub max_len: usize,
    pub side: PaddingSide,
}

fn pad_row(mut row: Vec<u32>, max_len: usize, pad: u32, side: PaddingSide) -> Vec<u32> {
    let missing = max_len - row.len();
    match side {
        PaddingSide::Left => {
            let mut padded = vec![pad; missing];
            padded.append(&mut row);
            padded
        }
        PaddingSide::Right => {
            row.extend(std::iter::repeat(pad).take(missing));
            row
        }
    }
}

/// Pads every request to `max_len`; padding positions are masked out.
pub fn pad_batch(
    requests: &[Request],
    max_len: usize,
    pad_id: u32,
    side: PaddingSide,
) -> Result<PaddedBatch> {
    let mut input_ids = Vec::with_capacity(requests.len());
    let mut attention_mask = Vec::with_capacity(requests.len());
    let mut input_lens = Vec::with_capacity(requests.len());
    for request in requests {
        let len = request.input_len();
        if len > max_len {
            return Err(SutError::config(format!(
                "request {} has {} input tokens, more than max_seq_len {}",
                request.id, len, max_len
            )));
        }
        if request.attention_mask.len() != len {
            return Err(SutError::config(format!(
                "request {} has {} input tokens but an attention mask of {}",
                request.id,
                len,
                request.attention_mask.len()
            )));
        }
        input_ids.push(pad_row(request.input_ids.clone(), max_len, pad_id, side));
        attention_mask.push(pad_row(request.attention_mask.clone(), max_len, 0, side));
        input_lens.push(len);
    }
    Ok(PaddedBatch {
        input_ids,
        attention_mask,
        input_lens,
        max_len,
        side,
    })
}

impl PaddedBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Prompts as sent to remote servers: special and pad ids removed.
    pub fn stripped_prompts(&self, special_ids: &[u32]) -> Vec<Vec<u32>> {
        self.input_ids
            .iter()
            .map(|row| strip_special(row, special_ids))
            .collect()
    }
}

pub fn strip_special(ids: &[u32], special_ids: &[u32]) -> Vec<u32> {
    ids.iter()
        .copied()
        .filter(|id| !special_ids.contains(id))
        .collect()
}

/// Keeps only the generated continuation of a local generation output: the
/// echoed (padded) prompt is dropped and everything after the first EOS is cut.
pub fn trim_continuation(output: &[u32], prompt_len: usize, eos_id: u32) -> Vec<u32> {
    let generated = output.get(prompt_len..).unwrap_or(&[]);
    match generated.iter().position(|id| *id == eos_id) {
        Some(pos) => generated[..=pos].to_vec(),
        None => generated.to_vec(),
    }
}
