use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Token id as seen by the core. The llama.cpp seam converts from its
/// signed token type at the boundary.
pub type TokenId = u32;

/// Smallest temperature handed to a probability-based sampler. A requested
/// temperature of exactly zero means greedy decoding, which samplers do not
/// express directly, so zero is mapped to this sentinel with sampling off.
pub const MIN_TEMPERATURE: f32 = 0.01;

/// Default sampling parameters for a generation call. An adapter stores one
/// of these at construction time; per-call overrides never mutate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_new_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            max_new_tokens: 2048,
            top_p: 0.95,
            top_k: 40,
            repetition_penalty: 1.1,
        }
    }
}

/// Per-call overrides for [`GenerationOptions`]. Any `Some` field takes
/// precedence over the adapter's stored default for that field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionOverrides {
    pub temperature: Option<f32>,
    pub max_new_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repetition_penalty: Option<f32>,
}

/// Options after merging and temperature resolution, ready to hand to a
/// backend. `sampling == false` means greedy decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub temperature: f32,
    pub sampling: bool,
    pub max_new_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
}

impl GenerationOptions {
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.temperature < 0.0 {
            return Err(AdapterError::InvalidOptions(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if self.max_new_tokens == 0 {
            return Err(AdapterError::InvalidOptions(
                "max_new_tokens must be greater than 0".to_string(),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(AdapterError::InvalidOptions(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k == 0 {
            return Err(AdapterError::InvalidOptions(
                "top_k must be at least 1".to_string(),
            ));
        }
        if self.repetition_penalty < 1.0 {
            return Err(AdapterError::InvalidOptions(format!(
                "repetition_penalty must be >= 1, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }

    /// Merge per-call overrides over these defaults, field by field.
    pub fn merge(&self, overrides: &OptionOverrides) -> GenerationOptions {
        GenerationOptions {
            temperature: overrides.temperature.unwrap_or(self.temperature),
            max_new_tokens: overrides.max_new_tokens.unwrap_or(self.max_new_tokens),
            top_p: overrides.top_p.unwrap_or(self.top_p),
            top_k: overrides.top_k.unwrap_or(self.top_k),
            repetition_penalty: overrides
                .repetition_penalty
                .unwrap_or(self.repetition_penalty),
        }
    }

    /// Resolve the temperature-zero rule: a temperature of exactly 0 forces
    /// greedy decoding with the stored temperature set to [`MIN_TEMPERATURE`],
    /// regardless of the other sampling fields.
    pub fn resolved(&self) -> ResolvedOptions {
        let greedy = self.temperature == 0.0;
        ResolvedOptions {
            temperature: if greedy {
                MIN_TEMPERATURE
            } else {
                self.temperature
            },
            sampling: !greedy,
            max_new_tokens: self.max_new_tokens,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
        }
    }
}

/// Ordered set of distinct, non-empty stop strings for one generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopSpecification {
    entries: Vec<String>,
}

impl StopSpecification {
    /// Build a specification, rejecting empty entries and dropping duplicates
    /// while preserving first-seen order.
    pub fn new<I, S>(entries: I) -> Result<Self, AdapterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.into();
            if entry.is_empty() {
                return Err(AdapterError::InvalidStopSequence(entry));
            }
            if !out.contains(&entry) {
                out.push(entry);
            }
        }
        Ok(Self { entries: out })
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Append a `"\n"`-prefixed duplicate for each entry, so a stop word at
    /// the start of a line is also caught when models emit the newline first.
    pub fn with_newline_variants(mut self) -> Self {
        let variants: Vec<String> = self
            .entries
            .iter()
            .map(|s| format!("\n{}", s))
            .filter(|v| !self.entries.contains(v))
            .collect();
        self.entries.extend(variants);
        self
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a generation loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishReason {
    /// A stop sequence was produced.
    Stop,
    /// The maximum number of new tokens was reached.
    MaxTokens,
    /// The model emitted an end-of-generation token.
    EndOfSequence,
    /// The consumer stopped reading before generation finished.
    Cancelled,
    Error(String),
}

#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("invalid stop sequence {0:?}: no trimming of its token encoding decodes back to the original string")]
    InvalidStopSequence(String),

    #[error("invalid generation options: {0}")]
    InvalidOptions(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("adapter for model {0:?} has been unloaded")]
    Unloaded(String),
}

/// Whether a local model holds full-precision or quantized weights. Both
/// load through the same GGUF loader; the kind steers file auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalKind {
    FullPrecision,
    Quantized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelSource {
    HuggingFace {
        repo: String,
        filename: Option<String>,
    },
    Local {
        folder: PathBuf,
        filename: Option<String>,
    },
}

impl ModelSource {
    pub fn validate(&self) -> Result<(), AdapterError> {
        match self {
            ModelSource::HuggingFace { repo, filename } => {
                if repo.is_empty() {
                    return Err(AdapterError::InvalidOptions(
                        "HuggingFace repo name cannot be empty".to_string(),
                    ));
                }
                if !repo.contains('/') {
                    return Err(AdapterError::InvalidOptions(
                        "HuggingFace repo must be in format 'org/repo'".to_string(),
                    ));
                }
                if let Some(f) = filename {
                    validate_gguf_filename(f)?;
                }
                Ok(())
            }
            ModelSource::Local { folder, filename } => {
                if !folder.is_dir() {
                    return Err(AdapterError::InvalidOptions(format!(
                        "model folder does not exist: {}",
                        folder.display()
                    )));
                }
                if let Some(f) = filename {
                    validate_gguf_filename(f)?;
                    let full_path = folder.join(f);
                    if !full_path.is_file() {
                        return Err(AdapterError::InvalidOptions(format!(
                            "model file does not exist: {}",
                            full_path.display()
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

fn validate_gguf_filename(f: &str) -> Result<(), AdapterError> {
    if f.is_empty() {
        return Err(AdapterError::InvalidOptions(
            "model filename cannot be empty".to_string(),
        ));
    }
    if !f.ends_with(".gguf") {
        return Err(AdapterError::InvalidOptions(format!(
            "model file must have .gguf extension: {}",
            f
        )));
    }
    Ok(())
}

/// Configuration for a local llama.cpp-backed model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalModelConfig {
    pub source: ModelSource,
    pub kind: LocalKind,
    pub batch_size: u32,
    pub context_length: u32,
}

impl LocalModelConfig {
    pub fn new(source: ModelSource, kind: LocalKind) -> Self {
        Self {
            source,
            kind,
            batch_size: 512,
            context_length: 4096,
        }
    }

    pub fn validate(&self) -> Result<(), AdapterError> {
        self.source.validate()?;
        if self.batch_size == 0 {
            return Err(AdapterError::InvalidOptions(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.context_length == 0 {
            return Err(AdapterError::InvalidOptions(
                "context_length must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for an OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), AdapterError> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(AdapterError::InvalidOptions(format!(
                "base_url must start with http:// or https://: {}",
                self.base_url
            )));
        }
        if self.model.is_empty() {
            return Err(AdapterError::InvalidOptions(
                "remote model name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
