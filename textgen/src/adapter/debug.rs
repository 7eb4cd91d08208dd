use crate::adapter::{postprocess_completion, GenerationAdapter};
use crate::stream::{StopStream, TokenStream};
use crate::types::{AdapterError, GenerationOptions, OptionOverrides, StopSpecification};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Inert adapter that answers every prompt with a fixed reply. Loads no
/// weights and touches no network, which makes it the backend for tests and
/// for exercising pipelines without a model on disk.
pub struct DebugAdapter {
    model_id: String,
    reply: String,
    defaults: GenerationOptions,
    unloaded: AtomicBool,
}

const DEFAULT_REPLY: &str = "This is a debug reply.";

impl DebugAdapter {
    pub fn new(defaults: GenerationOptions) -> Result<Self, AdapterError> {
        Self::with_reply(DEFAULT_REPLY, defaults)
    }

    /// Build a debug adapter that always answers with `reply`.
    pub fn with_reply(
        reply: impl Into<String>,
        defaults: GenerationOptions,
    ) -> Result<Self, AdapterError> {
        defaults.validate()?;
        Ok(Self {
            model_id: "debug".to_string(),
            reply: reply.into(),
            defaults,
            unloaded: AtomicBool::new(false),
        })
    }

    fn check_loaded(&self) -> Result<(), AdapterError> {
        if self.unloaded.load(Ordering::SeqCst) {
            return Err(AdapterError::Unloaded(self.model_id.clone()));
        }
        Ok(())
    }

    fn validate_call(&self, overrides: &OptionOverrides) -> Result<(), AdapterError> {
        self.check_loaded()?;
        self.defaults.merge(overrides).validate()
    }
}

#[async_trait]
impl GenerationAdapter for DebugAdapter {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        prompt: &str,
        overrides: OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<String, AdapterError> {
        self.validate_call(&overrides)?;
        debug!(chars = prompt.len(), "debug adapter answering prompt");
        postprocess_completion(&self.reply, prompt, stop)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        overrides: OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<TokenStream, AdapterError> {
        self.validate_call(&overrides)?;
        debug!(chars = prompt.len(), "debug adapter streaming reply");
        // Wordish increments so stop matching across chunk boundaries gets
        // exercised the same way it is with real token pieces.
        let pieces: Vec<Result<String, AdapterError>> = self
            .reply
            .split_inclusive(' ')
            .map(|piece| Ok(piece.to_string()))
            .collect();
        let inner: TokenStream = Box::pin(futures::stream::iter(pieces));
        Ok(Box::pin(StopStream::new(inner, stop)))
    }

    async fn unload(&self) -> Result<(), AdapterError> {
        self.unloaded.store(true, Ordering::SeqCst);
        Ok(())
    }
}
