use super::GenerationParams;
use crate::batch::{pad_batch, trim_continuation, PaddedBatch, PaddingSide};
use crate::config::SutConfig;
use crate::error::{Result, SutError};
use crate::relay::FirstTokenEmitter;
use crate::request::Request;
use std::sync::Arc;

/// In-process model. Loading and running it is the caller's business.
pub trait Generator: Send + Sync {
    /// Returns one full sequence per row: the padded prompt followed by the
    /// generated tokens. When an observer is given, every generation step is
    /// pushed to it, starting with the prompt itself.
    fn generate(
        &self,
        batch: &PaddedBatch,
        params: &GenerationParams,
        observer: Option<&mut dyn TokenObserver>,
    ) -> Result<Vec<Vec<u32>>>;
}

pub trait TokenObserver {
    fn put(&mut self, tokens: &[u32]) -> Result<()>;

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forwards the first generated token to the relay and caches all of them.
/// Assumes a batch of one.
pub struct FirstTokenStreamer<'a> {
    emitter: &'a mut FirstTokenEmitter,
    // The generator pushes the prompt before the first generated token.
    is_prompt: bool,
    tokens: Vec<u32>,
}

impl<'a> FirstTokenStreamer<'a> {
    pub fn new(emitter: &'a mut FirstTokenEmitter) -> Self {
        Self {
            emitter,
            is_prompt: true,
            tokens: Vec::new(),
        }
    }

    pub fn into_tokens(self) -> Vec<u32> {
        self.tokens
    }
}

impl TokenObserver for FirstTokenStreamer<'_> {
    fn put(&mut self, tokens: &[u32]) -> Result<()> {
        if self.is_prompt {
            self.is_prompt = false;
            return Ok(());
        }
        if let Some(first) = tokens.first() {
            self.emitter.emit(*first)?;
        }
        self.tokens.extend_from_slice(tokens);
        Ok(())
    }
}

pub struct LocalBackend {
    generator: Arc<dyn Generator>,
    params: GenerationParams,
    pad_token_id: u32,
    eos_token_id: u32,
    side: PaddingSide,
}

impl LocalBackend {
    pub fn new(config: &SutConfig, generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            params: config.generation.clone(),
            pad_token_id: config.pad_token_id,
            eos_token_id: config.eos_token_id,
            side: config.padding_side,
        }
    }

    pub fn invoke(&self, batch: &PaddedBatch) -> Result<Vec<Vec<u32>>> {
        let outputs = self.generator.generate(batch, &self.params, None)?;
        if outputs.len() != batch.len() {
            return Err(SutError::generation(format!(
                "model returned {} sequences for a batch of {}",
                outputs.len(),
                batch.len()
            )));
        }
        Ok(outputs
            .iter()
            .map(|output| trim_continuation(output, batch.max_len, self.eos_token_id))
            .collect())
    }

    /// Unpadded single-request generation with a first-token streamer attached.
    pub fn invoke_streaming(
        &self,
        request: &Request,
        emitter: &mut FirstTokenEmitter,
    ) -> Result<Vec<u32>> {
        let batch = pad_batch(
            std::slice::from_ref(request),
            request.input_len(),
            self.pad_token_id,
            self.side,
        )?;
        let mut streamer = FirstTokenStreamer::new(emitter);
        self.generator
            .generate(&batch, &self.params, Some(&mut streamer))?;
        streamer.end()?;
        Ok(streamer.into_tokens())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingGenerator;
    use super::*;
    use crate::request::ResponseId;

    fn backend(steps: u32) -> LocalBackend {
        LocalBackend::new(
            &SutConfig::default(),
            Arc::new(CountingGenerator { steps, eos: 2 }),
        )
    }

    #[test]
    fn batch_outputs_are_trimmed_to_continuation() {
        let requests = vec![
            Request::new(ResponseId(0), 0, vec![1, 5, 6]),
            Request::new(ResponseId(1), 1, vec![1, 7]),
        ];
        let batch = pad_batch(&requests, 8, 2, PaddingSide::Left).unwrap();
        let outputs = backend(2).invoke(&batch).unwrap();
        assert_eq!(outputs, vec![vec![103, 104, 2], vec![102, 103, 2]]);
    }

    #[test]
    fn streamer_skips_prompt_and_reports_first_generated_token() {
        let request = Request::new(ResponseId(3), 0, vec![1, 9, 9, 9]);
        let mut emitter = FirstTokenEmitter::detached(request.id);
        let tokens = backend(3).invoke_streaming(&request, &mut emitter).unwrap();
        assert_eq!(tokens, vec![104, 105, 106, 2]);
        assert_eq!(emitter.token(), Some(104));
        assert_eq!(emitter.token(), tokens.first().copied());
    }

    #[test]
    fn prompt_only_generation_emits_nothing() {
        let mut emitter = FirstTokenEmitter::detached(ResponseId(0));
        let mut streamer = FirstTokenStreamer::new(&mut emitter);
        streamer.put(&[1, 2, 3]).unwrap();
        assert!(streamer.into_tokens().is_empty());
        assert_eq!(emitter.token(), None);
    }
}
