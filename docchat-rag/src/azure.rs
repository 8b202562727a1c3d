//! Azure OpenAI embedding and chat completion adapters.
//!
//! Both adapters call the deployment-scoped REST endpoints directly with
//! `reqwest`:
//!
//! - `POST {endpoint}/openai/deployments/{deployment}/embeddings?api-version=...`
//! - `POST {endpoint}/openai/deployments/{deployment}/chat/completions?api-version=...`
//!
//! Failures are classified by [`crate::http`] so callers can tell a rate limit
//! from a rejected key. Streamed completions are read as server-sent events.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{StreamExt, TryStreamExt, future};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result, ServiceErrorKind};
use crate::http::{HttpFailure, build_client, event_stream_failure, send_checked, send_json};
use crate::llm::{CompletionModel, CompletionStream, Message};

const PROVIDER: &str = "azure-openai";

/// Data of the event that ends a streamed completion.
const STREAM_DONE: &str = "[DONE]";

/// Connection parameters for one Azure OpenAI deployment.
#[derive(Clone, PartialEq, Eq)]
pub struct AzureOpenAIConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: String,
    /// Resource API key, sent as the `api-key` header.
    pub api_key: String,
    /// REST API version, e.g. `2024-08-01-preview`.
    pub api_version: String,
    /// Deployment name.
    pub deployment: String,
}

impl std::fmt::Debug for AzureOpenAIConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureOpenAIConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"***")
            .field("api_version", &self.api_version)
            .field("deployment", &self.deployment)
            .finish()
    }
}

impl AzureOpenAIConfig {
    fn url(&self, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{operation}?api-version={}",
            self.endpoint.trim_end_matches('/'),
            self.deployment,
            self.api_version
        )
    }

    fn validate(&self, what: &str) -> Result<()> {
        for (field, value) in [
            ("endpoint", &self.endpoint),
            ("api_key", &self.api_key),
            ("api_version", &self.api_version),
            ("deployment", &self.deployment),
        ] {
            if value.trim().is_empty() {
                return Err(RagError::Config(format!("{what} {field} must not be empty")));
            }
        }
        Ok(())
    }
}

fn embedding_error(failure: HttpFailure) -> RagError {
    RagError::Embedding { provider: PROVIDER.into(), kind: failure.kind, message: failure.message }
}

fn completion_error(failure: HttpFailure) -> RagError {
    RagError::Completion { provider: PROVIDER.into(), kind: failure.kind, message: failure.message }
}

// ── Embeddings ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// An [`EmbeddingProvider`] backed by an Azure OpenAI embeddings deployment.
///
/// # Example
///
/// ```rust,ignore
/// let provider = AzureOpenAIEmbeddingProvider::new(config, 1536, Duration::from_secs(60))?
///     .with_request_size(1000);
/// let vectors = provider.embed_batch(&["hello", "world"]).await?;
/// ```
pub struct AzureOpenAIEmbeddingProvider {
    client: reqwest::Client,
    config: AzureOpenAIConfig,
    url: String,
    dimensions: usize,
    request_size: usize,
}

impl AzureOpenAIEmbeddingProvider {
    /// Create a provider for a deployment producing `dimensions`-long vectors.
    pub fn new(config: AzureOpenAIConfig, dimensions: usize, timeout: Duration) -> Result<Self> {
        config.validate("embeddings")?;
        if dimensions == 0 {
            return Err(RagError::Config("embedding dimensions must be greater than zero".into()));
        }
        let client = build_client(timeout)
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {e}")))?;
        let url = config.url("embeddings");
        Ok(Self { client, config, url, dimensions, request_size: 1000 })
    }

    /// Cap the number of inputs sent in a single request.
    pub fn with_request_size(mut self, size: usize) -> Self {
        self.request_size = size.max(1);
        self
    }

    async fn request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let response: EmbeddingResponse = send_json(
            self.client
                .post(&self.url)
                .header("api-key", &self.config.api_key)
                .json(&EmbeddingRequest { input: texts }),
        )
        .await
        .map_err(|failure| {
            error!(provider = PROVIDER, kind = %failure.kind, "embedding request failed");
            embedding_error(failure)
        })?;

        let mut data = response.data;
        if data.len() != texts.len() {
            return Err(embedding_error(HttpFailure {
                kind: ServiceErrorKind::Malformed,
                message: format!("expected {} embeddings, got {}", texts.len(), data.len()),
            }));
        }
        data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            if item.embedding.len() != self.dimensions {
                return Err(embedding_error(HttpFailure {
                    kind: ServiceErrorKind::Malformed,
                    message: format!(
                        "deployment '{}' returned {}-dimensional vectors, configured for {}",
                        self.config.deployment,
                        item.embedding.len(),
                        self.dimensions
                    ),
                }));
            }
            vectors.push(item.embedding);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for AzureOpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!(provider = PROVIDER, text_len = text.len(), "embedding single text");
        let results = self.request(&[text]).await?;
        results.into_iter().next().ok_or_else(|| {
            embedding_error(HttpFailure {
                kind: ServiceErrorKind::Malformed,
                message: "API returned empty response".into(),
            })
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            provider = PROVIDER,
            batch_size = texts.len(),
            deployment = %self.config.deployment,
            "embedding batch"
        );
        let mut vectors = Vec::with_capacity(texts.len());
        for part in texts.chunks(self.request_size) {
            vectors.extend(self.request(part).await?);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}

// ── Chat completions ───────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Text carried by one streamed chunk. Role-only and content-filter chunks carry none.
fn chunk_text(data: &str) -> std::result::Result<Option<String>, HttpFailure> {
    let chunk: ChatChunk = serde_json::from_str(data).map_err(|e| HttpFailure {
        kind: ServiceErrorKind::Malformed,
        message: format!("failed to decode stream chunk: {e}"),
    })?;
    Ok(chunk
        .choices
        .into_iter()
        .find_map(|choice| choice.delta.and_then(|d| d.content))
        .filter(|text| !text.is_empty()))
}

/// A [`CompletionModel`] backed by an Azure OpenAI chat deployment.
pub struct AzureOpenAIChatModel {
    client: reqwest::Client,
    config: AzureOpenAIConfig,
    url: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl AzureOpenAIChatModel {
    /// Create a chat model for the given deployment.
    pub fn new(config: AzureOpenAIConfig, timeout: Duration) -> Result<Self> {
        config.validate("chat")?;
        let client = build_client(timeout)
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {e}")))?;
        let url = config.url("chat/completions");
        Ok(Self { client, config, url, max_tokens: None, temperature: None })
    }

    /// Limit the length of generated answers.
    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl CompletionModel for AzureOpenAIChatModel {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        debug!(
            provider = PROVIDER,
            deployment = %self.config.deployment,
            message_count = messages.len(),
            "requesting chat completion"
        );
        let request =
            ChatRequest { messages, max_tokens: self.max_tokens, temperature: self.temperature, stream: false };
        let response: ChatResponse = send_json(
            self.client.post(&self.url).header("api-key", &self.config.api_key).json(&request),
        )
        .await
        .map_err(|failure| {
            error!(provider = PROVIDER, kind = %failure.kind, "chat completion failed");
            completion_error(failure)
        })?;

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            completion_error(HttpFailure {
                kind: ServiceErrorKind::Malformed,
                message: "response contained no choices".into(),
            })
        })?;
        match choice.message.and_then(|m| m.content) {
            Some(content) => Ok(content),
            None => Err(completion_error(HttpFailure {
                kind: ServiceErrorKind::Malformed,
                message: format!(
                    "response had no content (finish_reason: {})",
                    choice.finish_reason.as_deref().unwrap_or("unknown")
                ),
            })),
        }
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<CompletionStream> {
        debug!(
            provider = PROVIDER,
            deployment = %self.config.deployment,
            message_count = messages.len(),
            "requesting streamed chat completion"
        );
        let request =
            ChatRequest { messages, max_tokens: self.max_tokens, temperature: self.temperature, stream: true };
        let response = send_checked(
            self.client.post(&self.url).header("api-key", &self.config.api_key).json(&request),
        )
        .await
        .map_err(|failure| {
            error!(provider = PROVIDER, kind = %failure.kind, "streamed chat completion failed");
            completion_error(failure)
        })?;

        let deltas = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| future::ready(!matches!(event, Ok(event) if event.data.trim() == STREAM_DONE)))
            .map(|event| {
                event
                    .map_err(event_stream_failure)
                    .and_then(|event| chunk_text(&event.data))
                    .map_err(completion_error)
            })
            .try_filter_map(|text| future::ready(Ok::<_, RagError>(text)));
        Ok(Box::pin(deltas))
    }

    fn name(&self) -> &str {
        &self.config.deployment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AzureOpenAIConfig {
        AzureOpenAIConfig {
            endpoint: "https://example.openai.azure.com/".into(),
            api_key: "secret".into(),
            api_version: "2024-08-01-preview".into(),
            deployment: "text-embedding-3-small".into(),
        }
    }

    #[test]
    fn deployment_urls() {
        assert_eq!(
            config().url("embeddings"),
            "https://example.openai.azure.com/openai/deployments/text-embedding-3-small/embeddings?api-version=2024-08-01-preview"
        );
    }

    #[test]
    fn debug_output_hides_the_key() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn empty_fields_are_configuration_errors() {
        let mut cfg = config();
        cfg.api_key.clear();
        let err = AzureOpenAIEmbeddingProvider::new(cfg, 1536, Duration::from_secs(5)).err().unwrap();
        assert!(matches!(err, RagError::Config(message) if message.contains("api_key")));
    }

    #[test]
    fn chat_request_omits_unset_options() {
        let messages = [Message::system("be brief"), Message::user("hi")];
        let body = serde_json::to_value(ChatRequest {
            messages: &messages,
            max_tokens: None,
            temperature: None,
            stream: false,
        })
        .unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn stream_chunks_yield_only_content() {
        let content = r#"{"choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(chunk_text(content).unwrap().as_deref(), Some("Hel"));

        let role_only = r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#;
        assert_eq!(chunk_text(role_only).unwrap(), None);

        let filter_results = r#"{"choices":[],"prompt_filter_results":[{"prompt_index":0}]}"#;
        assert_eq!(chunk_text(filter_results).unwrap(), None);

        let err = chunk_text("not json").unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::Malformed);
    }

    #[test]
    fn embedding_response_accepts_out_of_order_data() {
        let raw = r#"{"data":[{"embedding":[0.2],"index":1},{"embedding":[0.1],"index":0}]}"#;
        let mut parsed: EmbeddingResponse = serde_json::from_str(raw).unwrap();
        parsed.data.sort_by_key(|d| d.index);
        assert_eq!(parsed.data[0].embedding, vec![0.1]);
    }
}
