use crate::adapter::{postprocess_completion, GenerationAdapter};
use crate::stream::{StopStream, TokenStream};
use crate::types::{
    AdapterError, GenerationOptions, OptionOverrides, RemoteConfig, ResolvedOptions,
    StopSpecification,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use ulid::Ulid;

/// Completion-endpoint servers cap the stop list; send at most this many.
const MAX_REMOTE_STOPS: usize = 4;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
}

/// Adapter over an OpenAI-compatible `/completions` endpoint.
///
/// Stop handling is split: the first few stop strings ride along in the
/// request so the server can halt early, and the full set is enforced
/// client-side on whatever text comes back.
pub struct RemoteAdapter {
    client: RwLock<Option<reqwest::Client>>,
    config: RemoteConfig,
    defaults: GenerationOptions,
}

impl RemoteAdapter {
    pub fn new(config: RemoteConfig, defaults: GenerationOptions) -> Result<Self, AdapterError> {
        config.validate()?;
        defaults.validate()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Backend(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client: RwLock::new(Some(client)),
            config,
            defaults,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn http_client(&self) -> Result<reqwest::Client, AdapterError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| AdapterError::Unloaded(self.config.model.clone()))
    }

    fn resolve(&self, overrides: &OptionOverrides) -> Result<ResolvedOptions, AdapterError> {
        let merged = self.defaults.merge(overrides);
        merged.validate()?;
        Ok(merged.resolved())
    }

    async fn send_request(
        &self,
        client: &reqwest::Client,
        body: &CompletionRequest<'_>,
    ) -> Result<reqwest::Response, AdapterError> {
        let mut request = client.post(self.completions_url()).json(body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::Backend(format!("completion request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::Backend(format!(
                "completion request returned {status}: {detail}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationAdapter for RemoteAdapter {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn generate(
        &self,
        prompt: &str,
        overrides: OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<String, AdapterError> {
        let opts = self.resolve(&overrides)?;
        let client = self.http_client().await?;
        let request_id = Ulid::new();
        debug!(%request_id, model = self.config.model, "sending completion request");

        let body = CompletionRequest {
            model: &self.config.model,
            prompt,
            temperature: opts.temperature,
            max_tokens: opts.max_new_tokens,
            top_p: opts.top_p,
            stream: false,
            stop: remote_stops(stop),
        };
        let response = self.send_request(&client, &body).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Backend(format!("malformed completion response: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| {
                AdapterError::Backend("completion response contained no choices".to_string())
            })?;
        debug!(%request_id, chars = text.len(), "completion response received");
        postprocess_completion(&text, prompt, stop)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        overrides: OptionOverrides,
        stop: &StopSpecification,
    ) -> Result<TokenStream, AdapterError> {
        let opts = self.resolve(&overrides)?;
        let client = self.http_client().await?;
        let request_id = Ulid::new();
        debug!(%request_id, model = self.config.model, "sending streaming completion request");

        let body = CompletionRequest {
            model: &self.config.model,
            prompt,
            temperature: opts.temperature,
            max_tokens: opts.max_new_tokens,
            top_p: opts.top_p,
            stream: true,
            stop: remote_stops(stop),
        };
        let response = self.send_request(&client, &body).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(e) = forward_sse(response, &tx).await {
                warn!(%request_id, error = %e, "streaming completion failed");
                let _ = tx.send(Err(e));
            }
        });

        let inner: TokenStream = Box::pin(UnboundedReceiverStream::new(rx));
        Ok(Box::pin(StopStream::new(inner, stop)))
    }

    async fn unload(&self) -> Result<(), AdapterError> {
        self.client.write().await.take();
        Ok(())
    }
}

fn remote_stops(stop: &StopSpecification) -> Vec<&str> {
    stop.entries()
        .iter()
        .take(MAX_REMOTE_STOPS)
        .map(String::as_str)
        .collect()
}

/// Read a server-sent-event body line by line, publishing each chunk's text.
/// Stops at the `[DONE]` marker or when the consumer drops the channel.
async fn forward_sse(
    response: reqwest::Response,
    tx: &mpsc::UnboundedSender<Result<String, AdapterError>>,
) -> Result<(), AdapterError> {
    let mut bytes = response.bytes_stream();
    let mut pending = String::new();
    while let Some(chunk) = bytes.next().await {
        let chunk =
            chunk.map_err(|e| AdapterError::Backend(format!("stream read failed: {e}")))?;
        pending.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(newline) = pending.find('\n') {
            let line = pending[..newline].trim().to_string();
            pending.drain(..=newline);
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(());
            }
            let parsed: CompletionResponse = serde_json::from_str(data)
                .map_err(|e| AdapterError::Backend(format!("malformed stream chunk: {e}")))?;
            for choice in parsed.choices {
                if !choice.text.is_empty() && tx.send(Ok(choice.text)).is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
