use crate::adapter::{DebugAdapter, GenerationAdapter, LocalAdapter, RemoteAdapter};
use crate::types::{
    AdapterError, GenerationOptions, LocalKind, LocalModelConfig, ModelSource, RemoteConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Which backend family serves a given model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    LocalWeights,
    LocalQuantized,
    RemoteApi,
    Debug,
}

const QUANT_TAGS: &[&str] = &["gguf", "awq", "gptq", "q2", "q3", "q4", "q5", "q6", "q8"];
const FULL_PRECISION_TAGS: &[&str] = &["f16", "bf16", "f32"];

/// Classify a model identifier by its surface form. URLs and the `openai:`
/// scheme go remote, quantization tags pick the quantized local path,
/// explicit precision tags the full-precision one; anything else defaults to
/// full-precision local weights.
pub fn detect_backend_kind(model_id: &str) -> BackendKind {
    if model_id == "debug" {
        return BackendKind::Debug;
    }
    if model_id.starts_with("http://")
        || model_id.starts_with("https://")
        || model_id.starts_with("openai:")
    {
        return BackendKind::RemoteApi;
    }
    let lowered = model_id.to_ascii_lowercase();
    if FULL_PRECISION_TAGS.iter().any(|tag| lowered.contains(tag)) {
        return BackendKind::LocalWeights;
    }
    if QUANT_TAGS.iter().any(|tag| lowered.contains(tag)) {
        return BackendKind::LocalQuantized;
    }
    BackendKind::LocalWeights
}

/// Builds the adapter matching a model identifier.
///
/// ```no_run
/// # use textgen::factory::AdapterFactory;
/// # async fn demo() -> Result<(), textgen::AdapterError> {
/// let adapter = AdapterFactory::new("debug").build().await?;
/// let reply = adapter
///     .generate("Hello", Default::default(), &Default::default())
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct AdapterFactory {
    model_id: String,
    kind: BackendKind,
    defaults: GenerationOptions,
    api_key: Option<String>,
}

impl AdapterFactory {
    pub fn new(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let kind = detect_backend_kind(&model_id);
        Self {
            model_id,
            kind,
            defaults: GenerationOptions::default(),
            api_key: None,
        }
    }

    /// Override the detected backend kind.
    pub fn kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Default options applied to every call through the built adapter.
    pub fn defaults(mut self, defaults: GenerationOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// API key for remote backends; ignored by local ones.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub async fn build(self) -> Result<Arc<dyn GenerationAdapter>, AdapterError> {
        info!(model_id = self.model_id, kind = ?self.kind, "building adapter");
        match self.kind {
            BackendKind::Debug => Ok(Arc::new(DebugAdapter::new(self.defaults)?)),
            BackendKind::RemoteApi => {
                let config = remote_config(&self.model_id, self.api_key)?;
                Ok(Arc::new(RemoteAdapter::new(config, self.defaults)?))
            }
            BackendKind::LocalWeights => {
                let config =
                    LocalModelConfig::new(local_source(&self.model_id), LocalKind::FullPrecision);
                Ok(Arc::new(LocalAdapter::load(config, self.defaults).await?))
            }
            BackendKind::LocalQuantized => {
                let config =
                    LocalModelConfig::new(local_source(&self.model_id), LocalKind::Quantized);
                Ok(Arc::new(LocalAdapter::load(config, self.defaults).await?))
            }
        }
    }
}

/// `openai:gpt-4o-mini` addresses a model behind the default OpenAI endpoint;
/// a bare URL addresses any compatible server, with the model name taken
/// from the path-less remainder if one is appended after `#`.
fn remote_config(model_id: &str, api_key: Option<String>) -> Result<RemoteConfig, AdapterError> {
    let config = if let Some(model) = model_id.strip_prefix("openai:") {
        RemoteConfig {
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.to_string(),
            api_key,
        }
    } else {
        let (base_url, model) = match model_id.split_once('#') {
            Some((url, model)) => (url.to_string(), model.to_string()),
            None => (model_id.to_string(), "default".to_string()),
        };
        RemoteConfig {
            base_url,
            model,
            api_key,
        }
    };
    config.validate()?;
    Ok(config)
}

/// A path that exists on disk is used directly; anything else is treated as
/// a Hugging Face repository id.
fn local_source(model_id: &str) -> ModelSource {
    let path = Path::new(model_id);
    if path.exists() {
        if path.is_dir() {
            ModelSource::Local {
                folder: path.to_path_buf(),
                filename: None,
            }
        } else {
            let folder = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            ModelSource::Local { folder, filename }
        }
    } else {
        ModelSource::HuggingFace {
            repo: model_id.to_string(),
            filename: None,
        }
    }
}
