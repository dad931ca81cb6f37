use super::retry::RetryPolicy;
use super::sse::{SseEvent, SseReader};
use super::{http_client, parse_body, GenerationParams};
use crate::codec::TokenCodec;
use crate::error::{Result, SutError};
use crate::relay::FirstTokenEmitter;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::io::BufReader;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Prompt<'a> {
    Text(String),
    Batch(&'a [Vec<u32>]),
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: Prompt<'a>,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    index: usize,
    text: String,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    text: String,
    finish_reason: Option<String>,
    // Servers send either the matched stop string or the stop token id.
    stop_reason: Option<serde_json::Value>,
}

impl ChunkChoice {
    fn is_terminal(&self) -> bool {
        self.finish_reason.is_some() || self.stop_reason.as_ref().is_some_and(|r| !r.is_null())
    }
}

/// OpenAI-style `/v1/completions` protocol.
pub struct CompletionsClient {
    client: Client,
    endpoints: Vec<String>,
    model_name: String,
    params: GenerationParams,
    retry: RetryPolicy,
    codec: Arc<dyn TokenCodec>,
}

impl CompletionsClient {
    pub fn new(
        endpoints: Vec<String>,
        model_name: &str,
        params: GenerationParams,
        retry: RetryPolicy,
        codec: Arc<dyn TokenCodec>,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            endpoints,
            model_name: model_name.to_string(),
            params,
            retry,
            codec,
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn url(&self, endpoint: usize) -> Result<String> {
        let base = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| SutError::config(format!("no endpoint with index {endpoint}")))?;
        Ok(format!("{}/v1/completions", base.trim_end_matches('/')))
    }

    fn request_body<'a>(&'a self, prompt: Prompt<'a>, stream: bool) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model_name,
            prompt,
            max_tokens: self.params.max_new_tokens,
            temperature: 0.0,
            stream,
        }
    }

    fn complete(&self, url: &str, body: &CompletionRequest<'_>, expected: usize) -> Result<Vec<Vec<u32>>> {
        let mut response = self.retry.run(url, || {
            let response = self.client.post(url).json(body).send()?;
            if response.status() != StatusCode::OK {
                return Err(SutError::http_status(response.status()));
            }
            parse_body::<CompletionResponse>(response)
        })?;
        if response.choices.len() != expected {
            return Err(SutError::malformed(format!(
                "{} choices returned for {expected} prompts",
                response.choices.len()
            )));
        }
        response.choices.sort_by_key(|choice| choice.index);
        response
            .choices
            .iter()
            .map(|choice| self.codec.encode(&choice.text))
            .collect()
    }

    /// All prompts of a chunk in one request; choices come back by index.
    pub fn query_batch(&self, prompts: &[Vec<u32>], endpoint: usize) -> Result<Vec<Vec<u32>>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(endpoint)?;
        let body = self.request_body(Prompt::Batch(prompts), false);
        self.complete(&url, &body, prompts.len())
    }

    /// Streams one decoded prompt and re-encodes the joined text.
    ///
    /// Empty increments are skipped. A server that only ever sends empty
    /// increments therefore never produces a first token and the call does
    /// not return until the stream closes.
    pub fn stream(
        &self,
        prompt: &[u32],
        endpoint: usize,
        emitter: &mut FirstTokenEmitter,
    ) -> Result<Vec<u32>> {
        let url = self.url(endpoint)?;
        let body = self.request_body(Prompt::Text(self.codec.decode(prompt)?), true);
        let text = self.retry.run(&url, || {
            let response = self.client.post(&url).json(&body).send()?;
            if response.status() != StatusCode::OK {
                return Err(SutError::http_status(response.status()));
            }
            let mut reader = SseReader::new(BufReader::new(response));
            let mut pieces: Vec<String> = Vec::new();
            while let Some(SseEvent::Data(payload)) = reader.next_event()? {
                let chunk: CompletionChunk = serde_json::from_str(&payload)
                    .map_err(|e| SutError::malformed(format!("bad stream line: {e}")))?;
                let choice = chunk
                    .choices
                    .into_iter()
                    .next()
                    .ok_or_else(|| SutError::malformed("stream chunk without choices"))?;
                if choice.is_terminal() {
                    if choice.finish_reason.as_deref() == Some("stop") {
                        pieces.push(self.codec.eos_token().to_string());
                    } else {
                        warn!(
                            "Sequence finished without hitting eos token, finish_reason: {:?}, stop_reason: {:?}",
                            choice.finish_reason, choice.stop_reason
                        );
                    }
                    break;
                }
                if choice.text.is_empty() {
                    continue;
                }
                if emitter.token().is_none() {
                    if let Some(first) = self.codec.encode(&choice.text)?.first() {
                        emitter.emit(*first)?;
                    }
                }
                pieces.push(choice.text);
            }
            if pieces.is_empty() {
                return Err(SutError::EmptyStream);
            }
            Ok(pieces.concat())
        })?;
        self.codec.encode(&text)
    }
}
