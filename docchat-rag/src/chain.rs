//! Question answering over an ingested collection.
//!
//! A [`RagChain`] embeds the question, retrieves the most relevant chunks,
//! renders the prompt templates and asks the completion model for an answer.
//! It holds no per-conversation state.
//!
//! # Example
//!
//! ```rust,ignore
//! let chain = RagChain::builder()
//!     .config(config)
//!     .embedding_provider(embedder)
//!     .vector_store(store)
//!     .completion_model(model)
//!     .templates(PromptTemplates::load(dir, "system.txt", "user_query.txt")?)
//!     .collection("docchat")
//!     .build()?;
//!
//! chain.verify().await?;
//! let answer = chain.answer("What does chapter 2 cover?").await?;
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};

use crate::config::RagConfig;
use crate::document::SearchResult;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::llm::{CompletionModel, CompletionStream, Message};
use crate::prompt::{PromptTemplates, format_context};
use crate::retrieval::retrieve;
use crate::retry::retry;
use crate::vectorstore::VectorStore;

/// An answer and the context it was generated from.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// Retrieved chunks, most relevant first.
    pub context: Vec<SearchResult>,
}

/// The context of an answer whose text is still being generated.
pub struct AnswerStream {
    /// Retrieved chunks, most relevant first.
    pub context: Vec<SearchResult>,
    pub tokens: CompletionStream,
}

impl std::fmt::Debug for AnswerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerStream").field("context", &self.context).finish_non_exhaustive()
    }
}

/// Retrieval-augmented answering over one collection.
pub struct RagChain {
    config: RagConfig,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<dyn VectorStore>,
    completion_model: Arc<dyn CompletionModel>,
    templates: PromptTemplates,
    collection: String,
}

impl RagChain {
    /// Create a new [`RagChainBuilder`].
    pub fn builder() -> RagChainBuilder {
        RagChainBuilder::default()
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn templates(&self) -> &PromptTemplates {
        &self.templates
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Check that the collection exists and matches the embedding provider.
    ///
    /// # Errors
    ///
    /// [`RagError::Config`] when the collection is missing or was built with
    /// vectors of a different size.
    pub async fn verify(&self) -> Result<()> {
        let expected = self.embedding_provider.dimensions();
        let store = &self.vector_store;
        let collection = self.collection.as_str();
        match retry(&self.config.retry, "describe collection", || store.collection_dimensions(collection))
            .await?
        {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(RagError::Config(format!(
                "collection '{collection}' stores {actual}-dimensional vectors but the embedding \
                 deployment produces {expected}; re-ingest with --recreate"
            ))),
            None => Err(RagError::Config(format!(
                "collection '{collection}' does not exist; run `docchat ingest` first"
            ))),
        }
    }

    /// Retrieve the chunks most relevant to `question`.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<SearchResult>> {
        let question = validate_question(question)?;
        let provider = &self.embedding_provider;
        let embedding = retry(&self.config.retry, "embed question", || provider.embed(question))
            .instrument(info_span!("rag.embed", provider = provider.name()))
            .await?;

        let store = self.vector_store.as_ref();
        let collection = self.collection.as_str();
        let config = &self.config;
        let results = retry(&config.retry, "retrieve", || {
            retrieve(
                store,
                collection,
                &embedding,
                config.top_k,
                &config.search_strategy,
                config.similarity_threshold,
            )
        })
        .instrument(info_span!("rag.retrieve", collection, top_k = config.top_k, strategy = %config.search_strategy))
        .await?;

        debug!(result_count = results.len(), "retrieved context");
        Ok(results)
    }

    /// Answer `question` from the collection.
    ///
    /// # Errors
    ///
    /// [`RagError::InvalidInput`] for a blank question, before any service is
    /// called. Service failures surface after the retry policy is exhausted.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        let started = Instant::now();
        let (context, messages) = self.prepare(question).await?;

        let model = &self.completion_model;
        let text = retry(&self.config.retry, "complete", || model.complete(&messages))
            .instrument(info_span!("rag.complete", model = model.name()))
            .await?;

        info!(
            context_chunks = context.len(),
            answer_len = text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "answered question"
        );
        Ok(Answer { text, context })
    }

    /// Like [`RagChain::answer`], but the answer text arrives as it is generated.
    ///
    /// Retrieval and opening the completion stream are retried; a failure
    /// after the first delta ends the stream with that error.
    pub async fn answer_stream(&self, question: &str) -> Result<AnswerStream> {
        let (context, messages) = self.prepare(question).await?;

        let model = &self.completion_model;
        let tokens = retry(&self.config.retry, "complete", || model.complete_stream(&messages))
            .instrument(info_span!("rag.complete", model = model.name(), streaming = true))
            .await?;

        debug!(context_chunks = context.len(), "streaming answer");
        Ok(AnswerStream { context, tokens })
    }

    async fn prepare(&self, question: &str) -> Result<(Vec<SearchResult>, Vec<Message>)> {
        let question = validate_question(question)?;
        let context = self.retrieve(question).await?;

        let messages = {
            let _span = info_span!("rag.prompt", context_chunks = context.len()).entered();
            self.templates.render(question, &format_context(&context))
        };
        Ok((context, messages))
    }
}

/// Trims `question`, rejecting blank input.
pub fn validate_question(question: &str) -> Result<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(RagError::InvalidInput("Please enter a question.".to_string()));
    }
    Ok(trimmed)
}

/// Builder for constructing a [`RagChain`].
///
/// All fields are required.
#[derive(Default)]
pub struct RagChainBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    completion_model: Option<Arc<dyn CompletionModel>>,
    templates: Option<PromptTemplates>,
    collection: Option<String>,
}

impl RagChainBuilder {
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn completion_model(mut self, model: Arc<dyn CompletionModel>) -> Self {
        self.completion_model = Some(model);
        self
    }

    pub fn templates(mut self, templates: PromptTemplates) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Build the [`RagChain`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if any field is missing or the collection
    /// name is blank.
    pub fn build(self) -> Result<RagChain> {
        let required = |name: &str| RagError::Config(format!("{name} is required"));
        let config = self.config.ok_or_else(|| required("config"))?;
        let embedding_provider = self.embedding_provider.ok_or_else(|| required("embedding_provider"))?;
        let vector_store = self.vector_store.ok_or_else(|| required("vector_store"))?;
        let completion_model = self.completion_model.ok_or_else(|| required("completion_model"))?;
        let templates = self.templates.ok_or_else(|| required("templates"))?;
        let collection = self.collection.ok_or_else(|| required("collection"))?;
        if collection.trim().is_empty() {
            return Err(RagError::Config("collection name must not be empty".to_string()));
        }

        Ok(RagChain { config, embedding_provider, vector_store, completion_model, templates, collection })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_questions_are_invalid_input() {
        assert!(matches!(validate_question("  \n\t"), Err(RagError::InvalidInput(_))));
        assert_eq!(validate_question("  hi  ").unwrap(), "hi");
    }

    #[test]
    fn builder_names_missing_field() {
        let err = RagChain::builder().config(RagConfig::default()).build().err().unwrap();
        assert!(err.to_string().contains("embedding_provider"));
    }
}
