//! Environment-driven settings.
//!
//! [`Settings`] is read once at startup from the process environment (after
//! loading `.env` with `dotenvy`) and then passed around explicitly. Every
//! missing required key is reported in one error. A running server re-reads
//! `.env` with [`Settings::reload_from_env`] without touching its environment.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::azure::{AzureOpenAIChatModel, AzureOpenAIConfig, AzureOpenAIEmbeddingProvider};
use crate::chain::RagChain;
use crate::chunking::ChunkUnit;
use crate::config::RagConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::ingest::Ingestor;
use crate::llm::CompletionModel;
use crate::prompt::PromptTemplates;
use crate::qdrant::QdrantVectorStore;
use crate::retrieval::{SearchKind, SearchStrategy};
use crate::retry::RetryPolicy;
use crate::vectorstore::VectorStore;

/// A credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Everything the ingestion job, the chat server and the CLI need to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub qdrant_url: String,
    pub qdrant_api_key: Option<Secret>,
    /// Chat completion deployment.
    pub chat: AzureOpenAIConfig,
    /// Embedding deployment.
    pub embeddings: AzureOpenAIConfig,
    pub embedding_dimensions: usize,
    pub collection_name: String,
    pub pdf_path: PathBuf,
    pub prompts_dir: PathBuf,
    pub system_prompt_file: String,
    pub user_prompt_file: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub chunk_unit: ChunkUnit,
    /// Chunks per ingestion batch.
    pub batch_size: usize,
    /// Inputs per embedding HTTP request.
    pub embedding_batch_size: usize,
    pub search_type: SearchKind,
    pub retrieval_k: usize,
    pub mmr_fetch_k: usize,
    pub mmr_lambda: f32,
    pub similarity_threshold: f32,
    pub max_workers: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// OTLP collector endpoint; tracing export is off when unset.
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

/// Reads keys from a lookup function, remembering which required ones are absent.
struct Reader<F> {
    lookup: F,
    missing: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&mut self, key: &str) -> String {
        self.get(key).unwrap_or_else(|| {
            self.missing.push(key.to_string());
            String::new()
        })
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key).map_or(Ok(default), |raw| parse_value(key, &raw))
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key).map(|raw| parse_value(key, &raw)).transpose()
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse::<T>().map_err(|e| RagError::Config(format!("{key}='{raw}' is invalid: {e}")))
}

impl Settings {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Re-read settings with `.env` in the working directory laid over the
    /// process environment.
    pub fn reload_from_env() -> Result<Self> {
        Self::from_env_file(Path::new(".env"))
    }

    /// Read settings with the entries of `path` taking precedence over the
    /// process environment, so edits to the file take effect. The environment
    /// itself is left unchanged. A missing file contributes nothing.
    pub fn from_env_file(path: &Path) -> Result<Self> {
        let file = read_env_file(path)?;
        Self::from_lookup(|key| file.get(key).cloned().or_else(|| std::env::var(key).ok()))
    }

    /// Read settings from any key source. Blank values count as unset.
    ///
    /// # Errors
    ///
    /// [`RagError::MissingSettings`] naming every absent required key, then
    /// [`RagError::Config`] for the first unparseable or inconsistent value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = Reader { lookup, missing: Vec::new() };

        let qdrant_url = reader.required("QDRANT_URL");
        let chat = AzureOpenAIConfig {
            endpoint: reader.required("AZURE_OPENAI_ENDPOINT"),
            api_key: reader.required("AZURE_OPENAI_API_KEY"),
            api_version: reader.required("AZURE_OPENAI_API_VERSION"),
            deployment: reader.required("AZURE_OPENAI_DEPLOYMENT_NAME"),
        };
        let embeddings = AzureOpenAIConfig {
            endpoint: reader.required("AZURE_OPENAI_EMBEDDINGS_ENDPOINT"),
            api_key: reader.required("AZURE_OPENAI_EMBEDDINGS_API_KEY"),
            api_version: reader.required("AZURE_OPENAI_EMBEDDINGS_API_VERSION"),
            deployment: reader.required("AZURE_OPENAI_EMBEDDINGS_DEPLOYMENT_NAME"),
        };
        if !reader.missing.is_empty() {
            return Err(RagError::MissingSettings(std::mem::take(&mut reader.missing)));
        }

        let settings = Self {
            qdrant_url,
            qdrant_api_key: reader.get("QDRANT_API_KEY").map(Secret),
            chat,
            embeddings,
            embedding_dimensions: reader.parse_or("EMBEDDING_DIMENSIONS", 1536)?,
            collection_name: reader.or("COLLECTION_NAME", "docchat"),
            pdf_path: PathBuf::from(reader.or("PDF_PATH", "./document.pdf")),
            prompts_dir: PathBuf::from(reader.or("PROMPTS_DIR", "prompts")),
            system_prompt_file: reader.or("SYSTEM_PROMPT_FILE", "system.txt"),
            user_prompt_file: reader.or("USER_PROMPT_FILE", "user_query.txt"),
            chunk_size: reader.parse_or("CHUNK_SIZE", 2048)?,
            chunk_overlap: reader.parse_or("CHUNK_OVERLAP", 0)?,
            chunk_unit: reader.parse_or("CHUNK_UNIT", ChunkUnit::Chars)?,
            batch_size: reader.parse_or("BATCH_SIZE", 2)?,
            embedding_batch_size: reader.parse_or("EMBEDDING_BATCH_SIZE", 1000)?,
            search_type: reader.parse_or("SEARCH_TYPE", SearchKind::Mmr)?,
            retrieval_k: reader.parse_or("RETRIEVAL_K", 10)?,
            mmr_fetch_k: reader.parse_or("MMR_FETCH_K", 20)?,
            mmr_lambda: reader.parse_or("MMR_LAMBDA", 0.5)?,
            similarity_threshold: reader.parse_or("SIMILARITY_THRESHOLD", 0.0)?,
            max_workers: reader.parse_or("MAX_WORKERS", 8)?,
            request_timeout: Duration::from_secs(reader.parse_or("REQUEST_TIMEOUT_SECS", 60)?),
            max_retries: reader.parse_or("MAX_RETRIES", 3)?,
            retry_backoff: Duration::from_millis(reader.parse_or("RETRY_BACKOFF_MS", 500)?),
            max_tokens: reader.parse_opt("MAX_TOKENS")?,
            temperature: reader.parse_opt("TEMPERATURE")?,
            otlp_endpoint: reader.get("OTEL_EXPORTER_OTLP_ENDPOINT"),
            service_name: reader.or("MONITORING_SERVICE_NAME", "docchat"),
            host: reader.or("DOCCHAT_HOST", "127.0.0.1"),
            port: reader.parse_or("DOCCHAT_PORT", 8501)?,
        };

        if settings.request_timeout.is_zero() {
            return Err(RagError::Config("REQUEST_TIMEOUT_SECS must be greater than zero".to_string()));
        }
        settings.rag_config()?;
        Ok(settings)
    }

    /// The search strategy named by `SEARCH_TYPE` with its parameters.
    pub fn search_strategy(&self) -> SearchStrategy {
        match self.search_type {
            SearchKind::Similarity => SearchStrategy::Similarity,
            SearchKind::Mmr => SearchStrategy::Mmr { fetch_k: self.mmr_fetch_k, lambda: self.mmr_lambda },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: self.retry_backoff,
            ..RetryPolicy::default()
        }
    }

    /// The validated pipeline and chain tunables.
    pub fn rag_config(&self) -> Result<RagConfig> {
        RagConfig::builder()
            .chunk_size(self.chunk_size)
            .chunk_overlap(self.chunk_overlap)
            .chunk_unit(self.chunk_unit)
            .batch_size(self.batch_size)
            .embedding_request_size(self.embedding_batch_size)
            .embedding_dimensions(self.embedding_dimensions)
            .top_k(self.retrieval_k)
            .search_strategy(self.search_strategy())
            .similarity_threshold(self.similarity_threshold)
            .max_workers(self.max_workers)
            .retry(self.retry_policy())
            .build()
    }

    /// Stable hash over every setting; changes whenever any value changes.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        // Debug masks the credentials, so they are hashed on their own.
        format!("{self:?}").hash(&mut hasher);
        self.chat.api_key.hash(&mut hasher);
        self.embeddings.api_key.hash(&mut hasher);
        self.qdrant_api_key.as_ref().map(Secret::expose).hash(&mut hasher);
        hasher.finish()
    }

    /// Resolved settings as `(key, value)` pairs with credentials masked.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".to_string());
        vec![
            ("QDRANT_URL", self.qdrant_url.clone()),
            ("QDRANT_API_KEY", mask(self.qdrant_api_key.as_ref().map(Secret::expose))),
            ("AZURE_OPENAI_ENDPOINT", self.chat.endpoint.clone()),
            ("AZURE_OPENAI_API_KEY", mask(Some(&self.chat.api_key))),
            ("AZURE_OPENAI_API_VERSION", self.chat.api_version.clone()),
            ("AZURE_OPENAI_DEPLOYMENT_NAME", self.chat.deployment.clone()),
            ("AZURE_OPENAI_EMBEDDINGS_ENDPOINT", self.embeddings.endpoint.clone()),
            ("AZURE_OPENAI_EMBEDDINGS_API_KEY", mask(Some(&self.embeddings.api_key))),
            ("AZURE_OPENAI_EMBEDDINGS_API_VERSION", self.embeddings.api_version.clone()),
            ("AZURE_OPENAI_EMBEDDINGS_DEPLOYMENT_NAME", self.embeddings.deployment.clone()),
            ("EMBEDDING_DIMENSIONS", self.embedding_dimensions.to_string()),
            ("COLLECTION_NAME", self.collection_name.clone()),
            ("PDF_PATH", self.pdf_path.display().to_string()),
            ("PROMPTS_DIR", self.prompts_dir.display().to_string()),
            ("SYSTEM_PROMPT_FILE", self.system_prompt_file.clone()),
            ("USER_PROMPT_FILE", self.user_prompt_file.clone()),
            ("CHUNK_SIZE", self.chunk_size.to_string()),
            ("CHUNK_OVERLAP", self.chunk_overlap.to_string()),
            ("CHUNK_UNIT", self.chunk_unit.to_string()),
            ("BATCH_SIZE", self.batch_size.to_string()),
            ("EMBEDDING_BATCH_SIZE", self.embedding_batch_size.to_string()),
            ("SEARCH_TYPE", self.search_strategy().to_string()),
            ("RETRIEVAL_K", self.retrieval_k.to_string()),
            ("SIMILARITY_THRESHOLD", self.similarity_threshold.to_string()),
            ("MAX_WORKERS", self.max_workers.to_string()),
            ("REQUEST_TIMEOUT_SECS", self.request_timeout.as_secs().to_string()),
            ("MAX_RETRIES", self.max_retries.to_string()),
            ("RETRY_BACKOFF_MS", self.retry_backoff.as_millis().to_string()),
            ("MAX_TOKENS", opt(&self.max_tokens.map(|t| t.to_string()))),
            ("TEMPERATURE", opt(&self.temperature.map(|t| t.to_string()))),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", opt(&self.otlp_endpoint)),
            ("MONITORING_SERVICE_NAME", self.service_name.clone()),
            ("DOCCHAT_HOST", self.host.clone()),
            ("DOCCHAT_PORT", self.port.to_string()),
        ]
    }

    // ── Component factories ────────────────────────────────────────

    pub fn embedding_provider(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let provider = AzureOpenAIEmbeddingProvider::new(
            self.embeddings.clone(),
            self.embedding_dimensions,
            self.request_timeout,
        )?
        .with_request_size(self.embedding_batch_size);
        Ok(Arc::new(provider))
    }

    pub fn completion_model(&self) -> Result<Arc<dyn CompletionModel>> {
        let model = AzureOpenAIChatModel::new(self.chat.clone(), self.request_timeout)?
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature);
        Ok(Arc::new(model))
    }

    pub fn vector_store(&self) -> Result<Arc<dyn VectorStore>> {
        let api_key = self.qdrant_api_key.as_ref().map(|k| k.expose().to_string());
        Ok(Arc::new(QdrantVectorStore::new(&self.qdrant_url, api_key, self.request_timeout)?))
    }

    pub fn prompt_templates(&self) -> Result<PromptTemplates> {
        PromptTemplates::load(&self.prompts_dir, &self.system_prompt_file, &self.user_prompt_file)
    }

    /// Wire up a [`RagChain`] against the configured services.
    pub fn build_chain(&self) -> Result<RagChain> {
        RagChain::builder()
            .config(self.rag_config()?)
            .embedding_provider(self.embedding_provider()?)
            .vector_store(self.vector_store()?)
            .completion_model(self.completion_model()?)
            .templates(self.prompt_templates()?)
            .collection(self.collection_name.clone())
            .build()
    }

    /// Wire up an [`Ingestor`] against the configured services.
    pub fn build_ingestor(&self, config: RagConfig) -> Result<Ingestor> {
        Ok(Ingestor::new(config, self.embedding_provider()?, self.vector_store()?, self.collection_name.clone()))
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let invalid = |e: dotenvy::Error| RagError::Config(format!("failed to read {}: {e}", path.display()));
    match dotenvy::from_path_iter(path) {
        Ok(entries) => entries.map(|entry| entry.map_err(invalid)).collect(),
        Err(e) if e.not_found() => Ok(HashMap::new()),
        Err(e) => Err(invalid(e)),
    }
}

fn mask(secret: Option<&str>) -> String {
    match secret {
        None => "(unset)".to_string(),
        Some(s) if s.len() <= 4 => "****".to_string(),
        Some(s) => {
            let tail: String = s.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
            format!("****{tail}")
        }
    }
}
