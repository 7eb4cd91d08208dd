use crate::adapter::{postprocess_completion, GenerationAdapter};
use crate::stopper::{KeywordStopper, MaxTokensStopper, Stopper};
use crate::stream::{StopStream, TokenStream};
use crate::tokenizer::Tokenizer;
use crate::types::{
    AdapterError, FinishReason, GenerationOptions, LocalKind, LocalModelConfig, ModelSource,
    OptionOverrides, ResolvedOptions, StopSpecification, TokenId,
};
use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use llama_cpp_2::{
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
    token::LlamaToken,
};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use ulid::Ulid;

static GLOBAL_BACKEND: OnceLock<Arc<LlamaBackend>> = OnceLock::new();

/// Fixed seed for the distribution sampler so temperature-0 runs stay
/// reproducible end to end.
const SAMPLER_SEED: u32 = 1234;

fn global_backend() -> Result<Arc<LlamaBackend>, AdapterError> {
    if let Some(backend) = GLOBAL_BACKEND.get() {
        return Ok(backend.clone());
    }
    let backend = match LlamaBackend::init() {
        Ok(backend) => Arc::new(backend),
        Err(llama_cpp_2::LlamaCppError::BackendAlreadyInitialized) => {
            return Err(AdapterError::Backend(
                "llama backend already initialized by external code".to_string(),
            ));
        }
        Err(e) => {
            return Err(AdapterError::Backend(format!(
                "failed to initialize llama backend: {e}"
            )));
        }
    };
    // Lost the set race: someone else stored one first, use theirs.
    if GLOBAL_BACKEND.set(backend.clone()).is_err() {
        return Ok(GLOBAL_BACKEND
            .get()
            .cloned()
            .unwrap_or(backend));
    }
    Ok(backend)
}

/// Tokenizer view over a loaded llama model. Token-id/text mapping only;
/// generation state lives in per-call contexts.
pub struct LlamaTokenizer {
    model: Arc<LlamaModel>,
}

impl LlamaTokenizer {
    pub fn new(model: Arc<LlamaModel>) -> Self {
        Self { model }
    }
}

impl Tokenizer for LlamaTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>, AdapterError> {
        let add_bos = if add_special_tokens {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| AdapterError::Backend(format!("tokenization failed: {e}")))?;
        Ok(tokens.into_iter().map(|t| t.0 as TokenId).collect())
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String, AdapterError> {
        let mut out = String::new();
        for id in ids {
            let piece = self
                .model
                .token_to_str(LlamaToken(*id as i32), Special::Tokenize)
                .map_err(|e| AdapterError::Backend(format!("detokenization failed: {e}")))?;
            out.push_str(&piece);
        }
        Ok(out)
    }
}

/// Adapter over local GGUF weights via llama.cpp, covering both the
/// full-precision and the quantized local backend variants: in this stack
/// both formats load through the same GGUF loader, and the declared kind
/// steers which file is picked when auto-detecting.
pub struct LocalAdapter {
    model: RwLock<Option<Arc<LlamaModel>>>,
    backend: Arc<LlamaBackend>,
    model_id: String,
    config: LocalModelConfig,
    defaults: GenerationOptions,
}

impl LocalAdapter {
    /// Load the model named by `config` and build an adapter with the given
    /// default options.
    pub async fn load(
        config: LocalModelConfig,
        defaults: GenerationOptions,
    ) -> Result<Self, AdapterError> {
        config.validate()?;
        defaults.validate()?;
        let backend = global_backend()?;

        let start = Instant::now();
        let (model_id, path) = resolve_model_path(&config).await?;
        info!(model_id, path = %path.display(), "loading local model");

        let model_params = LlamaModelParams::default();
        let model = LlamaModel::load_from_file(&backend, &path, &model_params).map_err(|e| {
            AdapterError::Backend(format!(
                "failed to load model from {}: {e}",
                path.display()
            ))
        })?;
        info!(model_id, elapsed = ?start.elapsed(), "local model loaded");

        Ok(Self {
            model: RwLock::new(Some(Arc::new(model))),
            backend,
            model_id,
            config,
            defaults,
        })
    }

    pub fn kind(&self) -> LocalKind {
        self.config.kind
    }

    async fn loaded_model(&self) -> Result<Arc<LlamaModel>, AdapterError> {
        self.model
            .read()
            .await
            .clone()
            .ok_or_else(|| AdapterError::Unloaded(self.model_id.clone()))
    }

    /// Prepare one generation call: merge and validate options, grab the
    /// model handle, canonicalize the stop strings against its tokenizer.
    async fn prepare(
        &self,
        overrides: &OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<(Arc<LlamaModel>, ResolvedOptions, Option<KeywordStopper>), AdapterError> {
        let merged = self.defaults.merge(overrides);
        merged.validate()?;
        let model = self.loaded_model().await?;
        let keywords = if stop.is_empty() {
            None
        } else {
            let tokenizer = LlamaTokenizer::new(model.clone());
            Some(KeywordStopper::from_spec(stop, &tokenizer)?)
        };
        Ok((model, merged.resolved(), keywords))
    }
}

#[async_trait]
impl GenerationAdapter for LocalAdapter {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        prompt: &str,
        overrides: OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<String, AdapterError> {
        let (model, opts, keywords) = self.prepare(&overrides, stop).await?;
        let backend = self.backend.clone();
        let batch_size = self.config.batch_size as usize;
        let context_length = self.config.context_length;
        let prompt_owned = prompt.to_string();
        let request_id = Ulid::new();
        debug!(%request_id, model_id = self.model_id, "starting blocking generation");

        let outcome = tokio::task::spawn_blocking(move || {
            run_generation(
                &backend,
                &model,
                &prompt_owned,
                &opts,
                batch_size,
                context_length,
                keywords,
                None,
            )
        })
        .await
        .map_err(|e| AdapterError::Backend(format!("generation worker panicked: {e}")))??;

        debug!(
            %request_id,
            tokens = outcome.tokens,
            finish = ?outcome.finish,
            "blocking generation finished"
        );
        postprocess_completion(&outcome.text, prompt, stop)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        overrides: OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<TokenStream, AdapterError> {
        let (model, opts, keywords) = self.prepare(&overrides, stop).await?;
        let backend = self.backend.clone();
        let batch_size = self.config.batch_size as usize;
        let context_length = self.config.context_length;
        let prompt_owned = prompt.to_string();
        let model_id = self.model_id.clone();
        let request_id = Ulid::new();
        debug!(%request_id, model_id, "starting streaming generation");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || {
            match run_generation(
                &backend,
                &model,
                &prompt_owned,
                &opts,
                batch_size,
                context_length,
                keywords,
                Some(&tx),
            ) {
                Ok(outcome) => {
                    debug!(
                        %request_id,
                        tokens = outcome.tokens,
                        finish = ?outcome.finish,
                        "streaming generation finished"
                    );
                }
                Err(e) => {
                    warn!(%request_id, error = %e, "streaming generation failed");
                    let _ = tx.send(Err(e));
                }
            }
            // Dropping the sender closes the channel: the stream-end sentinel.
        });

        let inner: TokenStream = Box::pin(UnboundedReceiverStream::new(rx));
        Ok(Box::pin(StopStream::new(inner, stop)))
    }

    async fn unload(&self) -> Result<(), AdapterError> {
        let mut guard = self.model.write().await;
        if guard.take().is_some() {
            info!(model_id = self.model_id, "unloaded local model");
        }
        Ok(())
    }
}

struct GenerationOutcome {
    text: String,
    tokens: u32,
    finish: FinishReason,
}

/// The autoregressive loop: prefill the prompt, then sample one token at a
/// time, checking stoppers after every id so generation halts at the token
/// level instead of running to the budget and truncating after the fact.
///
/// With a `sink`, each decoded piece is published as it is produced; a send
/// failure means the consumer dropped the stream, which cancels generation.
#[allow(clippy::too_many_arguments)]
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    opts: &ResolvedOptions,
    batch_size: usize,
    context_length: u32,
    mut keywords: Option<KeywordStopper>,
    sink: Option<&mpsc::UnboundedSender<Result<String, AdapterError>>>,
) -> Result<GenerationOutcome, AdapterError> {
    let context_params =
        LlamaContextParams::default().with_n_ctx(NonZeroU32::new(context_length));
    let mut ctx = model
        .new_context(backend, context_params)
        .map_err(|e| AdapterError::Backend(format!("failed to create context: {e}")))?;

    let prompt_tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| AdapterError::Backend(format!("failed to tokenize prompt: {e}")))?;

    let mut batch = LlamaBatch::new(prompt_tokens.len().max(batch_size), 1);
    for (i, token) in prompt_tokens.iter().enumerate() {
        let is_last = i == prompt_tokens.len() - 1;
        batch
            .add(*token, i as i32, &[0], is_last)
            .map_err(|e| AdapterError::Backend(format!("failed to build prompt batch: {e}")))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| AdapterError::Backend(format!("prompt decode failed: {e}")))?;

    let mut sampler = build_sampler(opts);
    let mut max_tokens = MaxTokensStopper::new(opts.max_new_tokens as usize);
    let mut generated_ids: Vec<TokenId> = Vec::new();
    let mut text = String::new();
    let mut n_cur = prompt_tokens.len();

    let finish = loop {
        let token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            break FinishReason::EndOfSequence;
        }

        generated_ids.push(token.0 as TokenId);
        let piece = match model.token_to_str(token, Special::Tokenize) {
            Ok(piece) => piece,
            Err(e) => {
                // An id with no clean text form; keep generating.
                warn!(error = %e, "failed to convert token to text");
                String::new()
            }
        };
        text.push_str(&piece);

        if let Some(sink) = sink {
            if !piece.is_empty() && sink.send(Ok(piece)).is_err() {
                break FinishReason::Cancelled;
            }
        }

        if let Some(keywords) = keywords.as_mut() {
            if let Some(reason) = keywords.observe(&generated_ids) {
                break reason;
            }
        }
        if let Some(reason) = max_tokens.observe(&generated_ids) {
            break reason;
        }

        batch.clear();
        batch
            .add(token, n_cur as i32, &[0], true)
            .map_err(|e| AdapterError::Backend(format!("failed to build batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| AdapterError::Backend(format!("decode failed: {e}")))?;
        n_cur += 1;
    };

    Ok(GenerationOutcome {
        text,
        tokens: generated_ids.len() as u32,
        finish,
    })
}

fn build_sampler(opts: &ResolvedOptions) -> LlamaSampler {
    let mut samplers: Vec<LlamaSampler> = Vec::new();
    if opts.repetition_penalty != 1.0 {
        samplers.push(LlamaSampler::penalties(64, opts.repetition_penalty, 0.0, 0.0));
    }
    if opts.sampling {
        samplers.push(LlamaSampler::top_k(opts.top_k as i32));
        samplers.push(LlamaSampler::top_p(opts.top_p, 1));
        samplers.push(LlamaSampler::temp(opts.temperature));
        samplers.push(LlamaSampler::dist(SAMPLER_SEED));
    } else {
        samplers.push(LlamaSampler::greedy());
    }
    LlamaSampler::chain_simple(samplers)
}

async fn resolve_model_path(config: &LocalModelConfig) -> Result<(String, PathBuf), AdapterError> {
    match &config.source {
        ModelSource::Local { folder, filename } => {
            let path = match filename {
                Some(filename) => folder.join(filename),
                None => auto_detect_model_file(folder, config.kind).await?,
            };
            if !path.is_file() {
                return Err(AdapterError::Backend(format!(
                    "model file does not exist: {}",
                    path.display()
                )));
            }
            let model_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok((model_id, path))
        }
        ModelSource::HuggingFace { repo, filename } => {
            let api = ApiBuilder::new()
                .build()
                .map_err(|e| AdapterError::Backend(format!("failed to create hub client: {e}")))?;
            let repo_api = api.model(repo.clone());
            let target = match filename {
                Some(filename) => filename.clone(),
                None => auto_detect_hub_file(&repo_api, repo, config.kind).await?,
            };
            info!(repo, file = target, "downloading model file");
            let path = repo_api.get(&target).await.map_err(|e| {
                AdapterError::Backend(format!(
                    "failed to download {target:?} from {repo:?}: {e}"
                ))
            })?;
            Ok((format!("{repo}/{target}"), path))
        }
    }
}

/// True for GGUF filenames that look like unquantized weights.
fn is_full_precision_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ["f16", "bf16", "f32"].iter().any(|tag| name.contains(tag))
}

fn pick_by_kind(mut files: Vec<String>, kind: LocalKind) -> Option<String> {
    if files.is_empty() {
        return None;
    }
    files.sort();
    let preferred = files.iter().find(|name| match kind {
        LocalKind::FullPrecision => is_full_precision_name(name),
        LocalKind::Quantized => !is_full_precision_name(name),
    });
    Some(preferred.unwrap_or(&files[0]).clone())
}

async fn auto_detect_model_file(folder: &Path, kind: LocalKind) -> Result<PathBuf, AdapterError> {
    let mut entries = tokio::fs::read_dir(folder)
        .await
        .map_err(|e| AdapterError::Backend(format!("cannot read {}: {e}", folder.display())))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AdapterError::Backend(e.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".gguf") {
            files.push(name);
        }
    }
    match pick_by_kind(files, kind) {
        Some(name) => Ok(folder.join(name)),
        None => Err(AdapterError::Backend(format!(
            "no .gguf model files found in {}",
            folder.display()
        ))),
    }
}

async fn auto_detect_hub_file(
    repo_api: &hf_hub::api::tokio::ApiRepo,
    repo: &str,
    kind: LocalKind,
) -> Result<String, AdapterError> {
    let info = repo_api.info().await.map_err(|e| {
        AdapterError::Backend(format!("failed to get repository info for {repo:?}: {e}"))
    })?;
    let files: Vec<String> = info
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .filter(|name| name.ends_with(".gguf"))
        .collect();
    pick_by_kind(files, kind).ok_or_else(|| {
        AdapterError::Backend(format!("no .gguf model files found in repository {repo:?}"))
    })
}
