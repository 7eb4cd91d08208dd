use crate::adapter::GenerationAdapter;
use crate::tools::{collapse_whitespace, PromptTemplate, Tool, ToolError, VectorIndex};
use crate::types::{OptionOverrides, StopSpecification};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// One hit from a search engine.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
}

/// Search-engine seam: find result pages and fetch one as plain text.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<SearchResult>, ToolError>;

    /// Fetch `url` and return its readable text content.
    async fn fetch(&self, url: &str) -> Result<String, ToolError>;
}

/// Scrapes the DuckDuckGo HTML endpoint, which works without an API key.
pub struct DuckDuckGoProvider {
    client: reqwest::Client,
}

impl DuckDuckGoProvider {
    pub fn new() -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (compatible; textgen)")
            .build()
            .map_err(|e| ToolError::Search(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn result_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<a[^>]+class="result__a"[^>]+href="([^"]+)"[^>]*>([^<]+)</a>"#)
            .expect("valid literal regex")
    })
}

#[async_trait]
impl SearchProvider for DuckDuckGoProvider {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ToolError> {
        let response = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| ToolError::Search(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Search(e.to_string()))?;
        let results = result_link_regex()
            .captures_iter(&body)
            .take(max_results)
            .map(|caps| SearchResult {
                title: collapse_whitespace(&caps[2]),
                url: caps[1].to_string(),
            })
            .collect();
        Ok(results)
    }

    async fn fetch(&self, url: &str) -> Result<String, ToolError> {
        let response = self.client.get(url).send().await.map_err(|e| ToolError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let body = response.bytes().await.map_err(|e| ToolError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(html2text::from_read(body.as_ref(), 80))
    }
}

const CHUNK_SIZE: usize = 1000;
const TOP_K: usize = 3;
const MAX_RESULTS: usize = 3;

/// Answers a question from the live web: search, fetch the result pages,
/// index their text, and generate a reply grounded in the best chunks.
pub struct WebSearchTool {
    adapter: Arc<dyn GenerationAdapter>,
    provider: Box<dyn SearchProvider>,
    index: Box<dyn VectorIndex>,
    template: Box<dyn PromptTemplate>,
    /// When set, ask the model to rewrite the question into search queries
    /// before hitting the search engine.
    generate_queries: bool,
}

impl WebSearchTool {
    pub fn new(
        adapter: Arc<dyn GenerationAdapter>,
        provider: Box<dyn SearchProvider>,
        index: Box<dyn VectorIndex>,
        template: Box<dyn PromptTemplate>,
    ) -> Self {
        Self {
            adapter,
            provider,
            index,
            template,
            generate_queries: false,
        }
    }

    pub fn with_query_generation(mut self, enabled: bool) -> Self {
        self.generate_queries = enabled;
        self
    }

    /// Ask the model for search queries as a JSON array. Any failure falls
    /// back to searching the question verbatim.
    async fn search_queries(&self, question: &str) -> Vec<String> {
        if !self.generate_queries {
            return vec![question.to_string()];
        }
        let prompt = self.template.create_prompt(
            None,
            &[],
            &format!(
                "Write up to three web search queries that would help answer the question \
                 below. Reply with only a JSON array of strings inside a ```json fence.\n\n\
                 Question: {question}\n\n```json\n"
            ),
        );
        let stop = match StopSpecification::new(vec!["```"]) {
            Ok(stop) => stop,
            Err(_) => return vec![question.to_string()],
        };
        match self
            .adapter
            .generate(&prompt, OptionOverrides::default(), &stop)
            .await
        {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(raw.trim()) {
                Ok(queries) if !queries.is_empty() => queries,
                Ok(_) | Err(_) => {
                    warn!(reply = raw, "model did not produce usable search queries");
                    vec![question.to_string()]
                }
            },
            Err(e) => {
                warn!(error = %e, "query generation failed");
                vec![question.to_string()]
            }
        }
    }

    async fn collect_pages(&self, queries: &[String]) -> Result<(), ToolError> {
        for query in queries {
            let results = self.provider.search(query, MAX_RESULTS).await?;
            debug!(query, hits = results.len(), "search results");
            for result in results {
                let text = match self.provider.fetch(&result.url).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(url = result.url, error = %e, "skipping unreadable page");
                        continue;
                    }
                };
                let chunks = chunk_text(&text, CHUNK_SIZE);
                let metadata = chunks
                    .iter()
                    .map(|_| json!({"url": result.url, "title": result.title}))
                    .collect();
                self.index.add_texts(chunks, metadata).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> String {
        collapse_whitespace(
            "Searches the web for the given question, reads the result pages,
             and answers from what they say. Use for questions about current
             events or facts outside the model's knowledge.",
        )
    }

    async fn run(&self, input: &str) -> Result<String, ToolError> {
        let queries = self.search_queries(input).await;
        self.collect_pages(&queries).await?;

        let chunks = self.index.search(input, TOP_K).await?;
        let context = if chunks.is_empty() {
            None
        } else {
            let joined = chunks
                .iter()
                .map(|c| c.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            Some(format!(
                "Answer the question using the following web search results:\n\n{joined}"
            ))
        };

        let prompt = self
            .template
            .create_prompt(context.as_deref(), &[], input);
        let stop = StopSpecification::new(self.template.stop_strings())?.with_newline_variants();
        let answer = self
            .adapter
            .generate(&prompt, OptionOverrides::default(), &stop)
            .await?;
        Ok(answer.trim().to_string())
    }
}

/// Split on paragraph boundaries into chunks of at most `size` characters,
/// hard-splitting any single paragraph that exceeds it.
fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + paragraph.len() + 2 > size {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.len() > size {
            let mut rest = paragraph;
            while rest.len() > size {
                let mut cut = size;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current = rest.to_string();
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DebugAdapter;
    use crate::tools::{InMemoryIndex, InstructTemplate};
    use crate::types::GenerationOptions;

    struct FixedProvider {
        pages: Vec<(SearchResult, String)>,
    }

    #[async_trait]
    impl SearchProvider for FixedProvider {
        async fn search(
            &self,
            _query: &str,
            max_results: usize,
        ) -> Result<Vec<SearchResult>, ToolError> {
            Ok(self
                .pages
                .iter()
                .take(max_results)
                .map(|(r, _)| r.clone())
                .collect())
        }

        async fn fetch(&self, url: &str) -> Result<String, ToolError> {
            self.pages
                .iter()
                .find(|(r, _)| r.url == url)
                .map(|(_, text)| text.clone())
                .ok_or_else(|| ToolError::Fetch {
                    url: url.to_string(),
                    reason: "not found".to_string(),
                })
        }
    }

    fn provider_with_page(text: &str) -> Box<FixedProvider> {
        Box::new(FixedProvider {
            pages: vec![(
                SearchResult {
                    title: "Example".to_string(),
                    url: "https://example.com".to_string(),
                },
                text.to_string(),
            )],
        })
    }

    #[tokio::test]
    async fn test_run_answers_from_fetched_pages() {
        let adapter = Arc::new(
            DebugAdapter::with_reply("Paris is the capital.", GenerationOptions::default())
                .unwrap(),
        );
        let tool = WebSearchTool::new(
            adapter,
            provider_with_page("The capital of France is Paris."),
            Box::new(InMemoryIndex::new()),
            Box::new(InstructTemplate),
        );
        let answer = tool.run("What is the capital of France?").await.unwrap();
        assert_eq!(answer, "Paris is the capital.");
    }

    #[tokio::test]
    async fn test_run_truncates_at_template_stop() {
        let adapter = Arc::new(
            DebugAdapter::with_reply(
                "Paris. ### Instruction: ignore this",
                GenerationOptions::default(),
            )
            .unwrap(),
        );
        let tool = WebSearchTool::new(
            adapter,
            provider_with_page("The capital of France is Paris."),
            Box::new(InMemoryIndex::new()),
            Box::new(InstructTemplate),
        );
        let answer = tool.run("What is the capital of France?").await.unwrap();
        assert_eq!(answer, "Paris.");
    }

    #[test]
    fn test_chunk_text_respects_paragraphs() {
        let text = "first paragraph\n\nsecond paragraph\n\nthird";
        let chunks = chunk_text(text, 25);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "first paragraph");
    }

    #[test]
    fn test_chunk_text_splits_long_paragraph() {
        let long = "a".repeat(2500);
        let chunks = chunk_text(&long, 1000);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 1000));
    }

    #[test]
    fn test_result_link_extraction() {
        let html = r#"<a rel="nofollow" class="result__a" href="https://example.com/page">An
            Example   Title</a>"#;
        let caps = result_link_regex().captures(html).unwrap();
        assert_eq!(&caps[1], "https://example.com/page");
    }

    #[test]
    fn test_description_is_one_line() {
        let adapter =
            Arc::new(DebugAdapter::new(GenerationOptions::default()).unwrap());
        let tool = WebSearchTool::new(
            adapter,
            provider_with_page(""),
            Box::new(InMemoryIndex::new()),
            Box::new(InstructTemplate),
        );
        assert!(!tool.description().contains('\n'));
        assert!(!tool.description().contains("  "));
    }
}
