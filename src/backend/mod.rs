//! Inference backends.
//!
//! A backend is chosen once at start-up and never re-selected during
//! dispatch. `Backend::Local` drives an in-process model; `Backend::Remote`
//! fans batches out over the configured endpoints through a closed set of
//! protocol clients.

pub mod completions;
pub mod local;
pub mod retry;
pub mod rpc;
pub mod sse;
pub mod text_generation;

use crate::batch::{strip_special, PaddedBatch};
use crate::codec::TokenCodec;
use crate::config::{Protocol, SutConfig};
use crate::error::{Result, SutError};
use crate::relay::FirstTokenEmitter;
use crate::request::Request;
use crate::router::FanOutRouter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub use completions::CompletionsClient;
pub use local::{FirstTokenStreamer, Generator, LocalBackend, TokenObserver};
pub use retry::RetryPolicy;
pub use rpc::{RpcBackend, RpcClient, RpcTokenStream};
pub use text_generation::TextGenerationClient;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    /// Deterministic highest-probability decoding, no sampling, one beam.
    pub greedy: bool,
    pub early_stopping: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            min_new_tokens: 1,
            greedy: true,
            early_stopping: true,
        }
    }
}

impl GenerationParams {
    pub fn decoding_method(&self) -> &'static str {
        if self.greedy {
            "GREEDY"
        } else {
            "SAMPLE"
        }
    }
}

/// Blocking client shared by the HTTP protocols. Benchmark servers commonly
/// run with self-signed certificates, and generations may take minutes, so
/// neither certificate checks nor a total request timeout apply.
pub(crate) fn http_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(60))
        .timeout(None::<Duration>)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| SutError::config(format!("Failed to create HTTP client: {e}")))
}

/// Reads a whole response body, then parses it. Only the parse can be
/// malformed; a failed read is a transport error and may be retried.
pub(crate) fn parse_body<T: DeserializeOwned>(response: reqwest::blocking::Response) -> Result<T> {
    let body = response.text()?;
    serde_json::from_str(&body)
        .map_err(|e| SutError::malformed(format!("unexpected response body: {e}")))
}

fn query_each<F>(chunk: &[Vec<u32>], query: F) -> Result<Vec<Vec<u32>>>
where
    F: Fn(&[u32]) -> Result<Vec<u32>> + Sync,
{
    thread::scope(|scope| {
        let handles: Vec<_> = chunk
            .iter()
            .map(|prompt| {
                let query = &query;
                scope.spawn(move || query(prompt.as_slice()))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(SutError::Panicked("endpoint request".to_string())))
            })
            .collect()
    })
}

/// The remote protocols a deployment can speak.
pub enum RemoteClient {
    TextGeneration(TextGenerationClient),
    Completions(CompletionsClient),
    Rpc(RpcBackend),
}

impl RemoteClient {
    pub fn endpoint_count(&self) -> usize {
        match self {
            RemoteClient::TextGeneration(client) => client.endpoint_count(),
            RemoteClient::Completions(client) => client.endpoint_count(),
            RemoteClient::Rpc(client) => client.endpoint_count(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            RemoteClient::TextGeneration(_) => Protocol::TextGeneration,
            RemoteClient::Completions(_) => Protocol::Completions,
            RemoteClient::Rpc(client) => Protocol::Rpc {
                batch: client.batched(),
            },
        }
    }

    /// Sends one chunk to one endpoint. Protocols with native batching send
    /// the chunk as a single call, the others one concurrent call per prompt.
    pub fn submit(&self, chunk: &[Vec<u32>], endpoint: usize) -> Result<Vec<Vec<u32>>> {
        match self {
            RemoteClient::TextGeneration(client) => {
                query_each(chunk, |prompt| client.query(prompt, endpoint))
            }
            RemoteClient::Completions(client) => client.query_batch(chunk, endpoint),
            RemoteClient::Rpc(client) if client.batched() => client.query_batch(chunk, endpoint),
            RemoteClient::Rpc(client) => query_each(chunk, |prompt| client.query(prompt, endpoint)),
        }
    }

    pub fn stream(
        &self,
        prompt: &[u32],
        endpoint: usize,
        emitter: &mut FirstTokenEmitter,
    ) -> Result<Vec<u32>> {
        match self {
            RemoteClient::TextGeneration(client) => client.stream(prompt, endpoint, emitter),
            RemoteClient::Completions(client) => client.stream(prompt, endpoint, emitter),
            RemoteClient::Rpc(client) => client.stream(prompt, endpoint, emitter),
        }
    }
}

pub enum Backend {
    Local(LocalBackend),
    Remote(FanOutRouter),
}

impl Backend {
    pub fn local(config: &SutConfig, generator: Arc<dyn Generator>) -> Self {
        Backend::Local(LocalBackend::new(config, generator))
    }

    /// One of the HTTP protocols, picked from the configuration flags.
    pub fn http(config: &SutConfig, codec: Arc<dyn TokenCodec>) -> Result<Self> {
        let endpoints = config.endpoints()?;
        let client = match config.protocol()? {
            Protocol::TextGeneration => RemoteClient::TextGeneration(TextGenerationClient::new(
                endpoints,
                config.model_name(),
                config.generation.clone(),
                config.retry.clone(),
                codec,
            )?),
            Protocol::Completions => RemoteClient::Completions(CompletionsClient::new(
                endpoints,
                config.model_name(),
                config.generation.clone(),
                config.retry.clone(),
                codec,
            )?),
            Protocol::Local => {
                return Err(SutError::config(
                    "an HTTP backend needs an api server to talk to",
                ))
            }
            Protocol::Rpc { .. } => {
                return Err(SutError::config(
                    "grpc was requested but no RPC clients were supplied",
                ))
            }
        };
        Ok(Backend::Remote(FanOutRouter::new(
            client,
            config.special_token_ids.clone(),
        )))
    }

    /// RPC protocol with one connected client per configured endpoint.
    pub fn rpc(
        config: &SutConfig,
        codec: Arc<dyn TokenCodec>,
        clients: Vec<Box<dyn RpcClient>>,
    ) -> Result<Self> {
        let Protocol::Rpc { batch } = config.protocol()? else {
            return Err(SutError::config(
                "RPC clients were supplied but grpc is not enabled",
            ));
        };
        let endpoints = config.endpoints()?;
        if clients.len() != endpoints.len() {
            return Err(SutError::config(format!(
                "{} RPC clients supplied for {} endpoints",
                clients.len(),
                endpoints.len()
            )));
        }
        let client = RpcBackend::new(
            clients,
            config.model_name(),
            batch,
            config.retry.clone(),
            codec,
        );
        Ok(Backend::Remote(FanOutRouter::new(
            RemoteClient::Rpc(client),
            config.special_token_ids.clone(),
        )))
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Backend::Local(_) => Protocol::Local,
            Backend::Remote(router) => router.client().protocol(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local(_))
    }

    pub fn endpoint_count(&self) -> usize {
        match self {
            Backend::Local(_) => 1,
            Backend::Remote(router) => router.client().endpoint_count(),
        }
    }

    /// Generated continuations for every row of `batch`, in row order.
    pub fn invoke(&self, batch: &PaddedBatch) -> Result<Vec<Vec<u32>>> {
        match self {
            Backend::Local(local) => local.invoke(batch),
            Backend::Remote(router) => router.route(batch),
        }
    }

    /// Streams one request; the first generated token goes through `emitter`.
    pub fn invoke_streaming(
        &self,
        request: &Request,
        endpoint: usize,
        emitter: &mut FirstTokenEmitter,
    ) -> Result<Vec<u32>> {
        match self {
            Backend::Local(local) => local.invoke_streaming(request, emitter),
            Backend::Remote(router) => {
                let prompt = strip_special(&request.input_ids, router.special_ids());
                router.client().stream(&prompt, endpoint, emitter)
            }
        }
    }
}
