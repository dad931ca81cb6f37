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

#[derive(Debug, Serialize)]
struct TextGenerationRequest<'a> {
    model_id: &'a str,
    inputs: String,
    parameters: TextGenerationParameters,
}

#[derive(Debug, Serialize)]
struct TextGenerationParameters {
    max_new_tokens: usize,
    min_new_tokens: usize,
    decoding_method: &'static str,
}

#[derive(Debug, Deserialize)]
struct GeneratedText {
    generated_text: String,
}

#[derive(Debug, Deserialize)]
struct StreamedTokens {
    #[serde(default)]
    tokens: Vec<StreamedToken>,
}

#[derive(Debug, Deserialize)]
struct StreamedToken {
    text: String,
}

/// Simple text-generation protocol: one decoded prompt per POST, the
/// response carries the generated text.
pub struct TextGenerationClient {
    client: Client,
    endpoints: Vec<String>,
    model_name: String,
    params: GenerationParams,
    retry: RetryPolicy,
    codec: Arc<dyn TokenCodec>,
}

impl TextGenerationClient {
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

    fn endpoint(&self, endpoint: usize) -> Result<&str> {
        self.endpoints
            .get(endpoint)
            .map(String::as_str)
            .ok_or_else(|| SutError::config(format!("no endpoint with index {endpoint}")))
    }

    fn request_body(&self, prompt: &[u32]) -> Result<TextGenerationRequest<'_>> {
        Ok(TextGenerationRequest {
            model_id: &self.model_name,
            inputs: self.codec.decode(prompt)?,
            parameters: TextGenerationParameters {
                max_new_tokens: self.params.max_new_tokens,
                min_new_tokens: self.params.min_new_tokens,
                decoding_method: self.params.decoding_method(),
            },
        })
    }

    pub fn query(&self, prompt: &[u32], endpoint: usize) -> Result<Vec<u32>> {
        let url = self.endpoint(endpoint)?;
        let body = self.request_body(prompt)?;
        let generated = self.retry.run(url, || {
            let response = self.client.post(url).json(&body).send()?;
            if response.status() != StatusCode::OK {
                return Err(SutError::http_status(response.status()));
            }
            parse_body::<GeneratedText>(response)
        })?;
        self.codec.encode(&generated.generated_text)
    }

    /// Streams one prompt. Each `data:` line carries at most one token,
    /// looked up directly in the vocabulary.
    pub fn stream(
        &self,
        prompt: &[u32],
        endpoint: usize,
        emitter: &mut FirstTokenEmitter,
    ) -> Result<Vec<u32>> {
        let url = self.endpoint(endpoint)?;
        let body = self.request_body(prompt)?;
        self.retry.run(url, || {
            let response = self.client.post(url).json(&body).send()?;
            if response.status() != StatusCode::OK {
                return Err(SutError::http_status(response.status()));
            }
            let mut reader = SseReader::new(BufReader::new(response));
            let mut tokens = Vec::new();
            while let Some(event) = reader.next_event()? {
                let SseEvent::Data(payload) = event else {
                    break;
                };
                let chunk: StreamedTokens = serde_json::from_str(&payload)
                    .map_err(|e| SutError::malformed(format!("bad stream line: {e}")))?;
                let Some(first) = chunk.tokens.first() else {
                    continue;
                };
                let token = self.codec.token_to_id(&first.text).ok_or_else(|| {
                    SutError::malformed(format!("token {:?} is not in the vocabulary", first.text))
                })?;
                emitter.emit(token)?;
                tokens.push(token);
            }
            Ok(tokens)
        })
    }
}
