//! Retrieval tools layered on top of the generation adapters: a prompt
//! template seam, a vector index seam, and a web search tool that answers a
//! question from fetched pages.

pub mod web_search;

pub use web_search::{SearchProvider, SearchResult, WebSearchTool};

use crate::types::AdapterError;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("search failed: {0}")]
    Search(String),

    #[error("page fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("index error: {0}")]
    Index(String),
}

/// One completed exchange in a conversation.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub user: String,
    pub assistant: String,
}

/// How prompts are assembled for a particular model family. Implementations
/// own the role markers, so they also know which strings end a model turn.
pub trait PromptTemplate: Send + Sync {
    /// Render a full prompt from optional context, history, and the new
    /// user message.
    fn create_prompt(&self, context: Option<&str>, history: &[ChatTurn], message: &str) -> String;

    /// The marker that opens a user turn.
    fn human_prefix(&self) -> &str;

    /// Strings whose appearance means the model has run past its own turn.
    fn stop_strings(&self) -> Vec<String>;
}

/// Plain `### Instruction` / `### Response` template, the common ground for
/// instruction-tuned models without a bespoke chat format.
#[derive(Debug, Default)]
pub struct InstructTemplate;

impl PromptTemplate for InstructTemplate {
    fn create_prompt(&self, context: Option<&str>, history: &[ChatTurn], message: &str) -> String {
        let mut prompt = String::new();
        if let Some(context) = context {
            prompt.push_str(context);
            prompt.push_str("\n\n");
        }
        for turn in history {
            prompt.push_str(&format!(
                "### Instruction:\n{}\n\n### Response:\n{}\n\n",
                turn.user, turn.assistant
            ));
        }
        prompt.push_str(&format!("### Instruction:\n{message}\n\n### Response:\n"));
        prompt
    }

    fn human_prefix(&self) -> &str {
        "### Instruction:"
    }

    fn stop_strings(&self) -> Vec<String> {
        vec!["### Instruction:".to_string(), "###".to_string()]
    }
}

/// A chunk returned from a similarity search, with its source metadata.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub text: String,
    pub score: f32,
    pub metadata: Value,
}

/// Storage seam for retrieved text. The in-memory implementation below is
/// the default; persistent stores plug in behind the same trait.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add_texts(&self, texts: Vec<String>, metadata: Vec<Value>) -> Result<(), ToolError>;

    /// The `k` chunks most similar to `query`, best first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, ToolError>;
}

/// Keyword-overlap index. Scores by the fraction of query terms a chunk
/// contains, which is enough for ranking a handful of freshly fetched pages.
#[derive(Default)]
pub struct InMemoryIndex {
    entries: Mutex<Vec<(String, Value)>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn keyword_score(query_terms: &[String], text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let lowered = text.to_lowercase();
    let hits = query_terms
        .iter()
        .filter(|term| lowered.contains(term.as_str()))
        .count();
    hits as f32 / query_terms.len() as f32
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn add_texts(&self, texts: Vec<String>, metadata: Vec<Value>) -> Result<(), ToolError> {
        if texts.len() != metadata.len() {
            return Err(ToolError::Index(format!(
                "got {} texts but {} metadata entries",
                texts.len(),
                metadata.len()
            )));
        }
        let mut entries = self.entries.lock().await;
        entries.extend(texts.into_iter().zip(metadata));
        Ok(())
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, ToolError> {
        let query_terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let entries = self.entries.lock().await;
        let mut scored: Vec<ScoredChunk> = entries
            .iter()
            .map(|(text, metadata)| ScoredChunk {
                text: text.clone(),
                score: keyword_score(&query_terms, text),
                metadata: metadata.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

/// A named capability an agent can invoke with a free-text input.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// One-line description for tool-selection prompts.
    fn description(&self) -> String;

    async fn run(&self, input: &str) -> Result<String, ToolError>;
}

/// Collapse runs of whitespace so multi-line description literals read as a
/// single prompt line.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let re = WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("valid literal regex"));
    re.replace_all(text.trim(), " ").into_owned()
}
