use crate::stream::{truncate_at_stop, TokenStream};
use crate::types::{AdapterError, OptionOverrides, StopSpecification};
use async_trait::async_trait;

pub mod debug;
pub mod local;
pub mod remote;

pub use debug::DebugAdapter;
pub use local::LocalAdapter;
pub use remote::RemoteAdapter;

/// One calling convention over heterogeneous generation backends.
///
/// Blocking and streaming calls apply the same stop-sequence truncation, so
/// callers observe one contract regardless of backend. Concurrent `generate`
/// calls on a single adapter are undefined unless externally serialized: the
/// underlying backends are not assumed to support more than one in-flight
/// generation per handle.
#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    fn model_id(&self) -> &str;

    /// Blocking generation: returns the full completion, prompt echo
    /// stripped and truncated before the first stop-string occurrence.
    async fn generate(
        &self,
        prompt: &str,
        overrides: OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<String, AdapterError>;

    /// Streaming generation: spawns a worker that publishes text increments
    /// through a channel; the returned stream is already stop-truncated.
    /// Dropping the stream early is a clean terminal state; the worker
    /// observes the closed channel and halts.
    async fn generate_stream(
        &self,
        prompt: &str,
        overrides: OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<TokenStream, AdapterError>;

    /// Release backend-held resources. Idempotent; subsequent generation
    /// calls fail with [`AdapterError::Unloaded`].
    async fn unload(&self) -> Result<(), AdapterError>;
}

/// Some backends return the prompt as a prefix of the raw output.
pub(crate) fn strip_prompt_echo<'a>(output: &'a str, prompt: &str) -> &'a str {
    output.strip_prefix(prompt).unwrap_or(output)
}

/// Shared blocking-path postprocessing: reject empty output, strip a prompt
/// echo, truncate at the first stop occurrence.
pub(crate) fn postprocess_completion(
    raw: &str,
    prompt: &str,
    stop: &StopSpecification,
) -> Result<String, AdapterError> {
    if raw.is_empty() {
        return Err(AdapterError::Backend(
            "backend returned no output".to_string(),
        ));
    }
    let stripped = strip_prompt_echo(raw, prompt);
    Ok(truncate_at_stop(stripped, stop.entries()).0)
}
