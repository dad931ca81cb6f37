#![allow(dead_code)]

use llama_sut::{
    decode_token_ids, CompletionSink, ProgressEvent, ProgressObserver, Request, ResponseId,
    Result, SutError, TokenCodec,
};
use parking_lot::Mutex;

/// Whitespace codec over decimal ids; `</s>` is id 2.
pub struct TestCodec;

impl TokenCodec for TestCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.replace("</s>", " </s> ")
            .split_whitespace()
            .map(|word| {
                self.token_to_id(word)
                    .ok_or_else(|| SutError::Tokenizer(format!("unknown word {word:?}")))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        match token.trim() {
            "</s>" => Some(2),
            word => word.parse().ok(),
        }
    }

    fn eos_token(&self) -> &str {
        "</s>"
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Report {
    FirstToken(ResponseId, u32),
    Complete(ResponseId, Vec<u32>),
}

/// Records every report in arrival order.
#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<Report>>,
}

impl RecordingSink {
    pub fn completed(&self) -> Vec<(ResponseId, Vec<u32>)> {
        let mut done: Vec<_> = self
            .reports
            .lock()
            .iter()
            .filter_map(|report| match report {
                Report::Complete(id, tokens) => Some((*id, tokens.clone())),
                Report::FirstToken(..) => None,
            })
            .collect();
        done.sort();
        done
    }

    pub fn first_tokens(&self) -> Vec<(ResponseId, u32)> {
        let mut first: Vec<_> = self
            .reports
            .lock()
            .iter()
            .filter_map(|report| match report {
                Report::FirstToken(id, token) => Some((*id, *token)),
                Report::Complete(..) => None,
            })
            .collect();
        first.sort();
        first
    }

    /// Every request got exactly one first token, strictly before its completion.
    pub fn assert_first_token_precedes_completion(&self, ids: &[ResponseId]) {
        let reports = self.reports.lock();
        for id in ids {
            let first: Vec<usize> = reports
                .iter()
                .enumerate()
                .filter(|(_, r)| matches!(r, Report::FirstToken(rid, _) if rid == id))
                .map(|(i, _)| i)
                .collect();
            let done: Vec<usize> = reports
                .iter()
                .enumerate()
                .filter(|(_, r)| matches!(r, Report::Complete(rid, _) if rid == id))
                .map(|(i, _)| i)
                .collect();
            assert_eq!(first.len(), 1, "first tokens for {id}");
            assert_eq!(done.len(), 1, "completions for {id}");
            assert!(first[0] < done[0], "request {id} completed before its first token");
        }
    }
}

impl CompletionSink for RecordingSink {
    fn complete(&self, id: ResponseId, data: &[u8], n_tokens: usize) {
        let tokens = decode_token_ids(data);
        assert_eq!(tokens.len(), n_tokens);
        self.reports.lock().push(Report::Complete(id, tokens));
    }

    fn complete_first_token(&self, id: ResponseId, data: &[u8]) {
        let tokens = decode_token_ids(data);
        assert_eq!(tokens.len(), 1);
        self.reports.lock().push(Report::FirstToken(id, tokens[0]));
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressObserver for RecordingProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}

pub fn requests(prompts: &[&[u32]]) -> Vec<Request> {
    prompts
        .iter()
        .enumerate()
        .map(|(i, ids)| Request::new(ResponseId(i as u64), i, ids.to_vec()))
        .collect()
}
