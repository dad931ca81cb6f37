use super::retry::RetryPolicy;
use crate::codec::TokenCodec;
use crate::error::{Result, SutError};
use crate::relay::FirstTokenEmitter;
use std::sync::Arc;

/// Server increments of a streamed generation. Each item holds the token
/// texts carried by one response message.
pub type RpcTokenStream = Box<dyn Iterator<Item = Result<Vec<String>>> + Send>;

/// A connected generation-service stub for one endpoint.
pub trait RpcClient: Send + Sync {
    /// One generated text per input, in input order.
    fn make_request(&self, inputs: &[String], model_id: &str) -> Result<Vec<String>>;

    fn make_request_stream(&self, input: &str, model_id: &str) -> Result<RpcTokenStream>;
}

pub struct RpcBackend {
    clients: Vec<Box<dyn RpcClient>>,
    model_name: String,
    batch: bool,
    retry: RetryPolicy,
    codec: Arc<dyn TokenCodec>,
}

impl RpcBackend {
    pub fn new(
        clients: Vec<Box<dyn RpcClient>>,
        model_name: &str,
        batch: bool,
        retry: RetryPolicy,
        codec: Arc<dyn TokenCodec>,
    ) -> Self {
        Self {
            clients,
            model_name: model_name.to_string(),
            batch,
            retry,
            codec,
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether a whole chunk goes out as one request.
    pub fn batched(&self) -> bool {
        self.batch
    }

    fn client(&self, endpoint: usize) -> Result<&dyn RpcClient> {
        self.clients
            .get(endpoint)
            .map(|client| &**client)
            .ok_or_else(|| SutError::config(format!("no RPC client with index {endpoint}")))
    }

    pub fn query(&self, prompt: &[u32], endpoint: usize) -> Result<Vec<u32>> {
        let mut outputs = self.query_batch(&[prompt.to_vec()], endpoint)?;
        Ok(outputs.pop().unwrap_or_default())
    }

    pub fn query_batch(&self, prompts: &[Vec<u32>], endpoint: usize) -> Result<Vec<Vec<u32>>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client(endpoint)?;
        let inputs = prompts
            .iter()
            .map(|prompt| self.codec.decode(prompt))
            .collect::<Result<Vec<_>>>()?;
        let label = format!("rpc endpoint {endpoint}");
        let texts = self
            .retry
            .run(&label, || client.make_request(&inputs, &self.model_name))?;
        if texts.len() != inputs.len() {
            return Err(SutError::malformed(format!(
                "{} responses returned for {} inputs",
                texts.len(),
                inputs.len()
            )));
        }
        texts.iter().map(|text| self.codec.encode(text)).collect()
    }

    pub fn stream(
        &self,
        prompt: &[u32],
        endpoint: usize,
        emitter: &mut FirstTokenEmitter,
    ) -> Result<Vec<u32>> {
        let client = self.client(endpoint)?;
        let input = self.codec.decode(prompt)?;
        let label = format!("rpc endpoint {endpoint}");
        self.retry.run(&label, || {
            let mut tokens = Vec::new();
            for message in client.make_request_stream(&input, &self.model_name)? {
                let texts = message?;
                let Some(text) = texts.first() else {
                    continue;
                };
                let token = self.codec.token_to_id(text).ok_or_else(|| {
                    SutError::malformed(format!("token {text:?} is not in the vocabulary"))
                })?;
                emitter.emit(token)?;
                tokens.push(token);
            }
            Ok(tokens)
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Echoes every input with `tail` appended; streams the same tokens.
    pub struct EchoRpc {
        pub tail: Vec<String>,
        pub delay: Duration,
        pub failures: AtomicUsize,
    }

    impl EchoRpc {
        pub fn new(tail: &[&str]) -> Self {
            Self {
                tail: tail.iter().map(|s| s.to_string()).collect(),
                delay: Duration::ZERO,
                failures: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing(self, times: usize) -> Self {
            self.failures.store(times, Ordering::SeqCst);
            self
        }

        fn maybe_fail(&self) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(SutError::Transport("unavailable".to_string()));
            }
            Ok(())
        }
    }

    impl RpcClient for EchoRpc {
        fn make_request(&self, inputs: &[String], _model_id: &str) -> Result<Vec<String>> {
            self.maybe_fail()?;
            thread::sleep(self.delay);
            Ok(inputs
                .iter()
                .map(|input| format!("{input} {}", self.tail.join(" ")))
                .collect())
        }

        fn make_request_stream(&self, _input: &str, _model_id: &str) -> Result<RpcTokenStream> {
            self.maybe_fail()?;
            let mut messages = vec![Ok(Vec::new())];
            messages.extend(self.tail.iter().map(|text| Ok(vec![text.clone()])));
            Ok(Box::new(messages.into_iter()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::EchoRpc;
    use super::*;
    use crate::codec::testing::DigitCodec;
    use crate::request::ResponseId;

    fn backend(client: EchoRpc, batch: bool) -> RpcBackend {
        RpcBackend::new(
            vec![Box::new(client)],
            "llama",
            batch,
            RetryPolicy::unlimited(),
            Arc::new(DigitCodec),
        )
    }

    #[test]
    fn batch_answers_in_order() {
        let backend = backend(EchoRpc::new(&["9"]), true);
        let outputs = backend.query_batch(&[vec![4], vec![5, 6]], 0).unwrap();
        assert_eq!(outputs, vec![vec![4, 9], vec![5, 6, 9]]);
        assert!(backend.batched());
    }

    #[test]
    fn stream_retries_and_reports_first_token() {
        let backend = backend(EchoRpc::new(&["7", "8", "</s>"]).failing(2), false);
        let mut emitter = FirstTokenEmitter::detached(ResponseId(1));
        let tokens = backend.stream(&[4, 5], 0, &mut emitter).unwrap();
        assert_eq!(tokens, vec![7, 8, 2]);
        assert_eq!(emitter.token(), Some(7));
    }

    #[test]
    fn unknown_stream_token_is_malformed() {
        let backend = backend(EchoRpc::new(&["seven"]), false);
        let mut emitter = FirstTokenEmitter::detached(ResponseId(1));
        let err = backend.stream(&[4], 0, &mut emitter).unwrap_err();
        assert!(matches!(err, SutError::MalformedResponse(_)));
    }
}
