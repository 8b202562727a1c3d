//! Batched ingestion: chunk → embed → upsert.
//!
//! The [`IngestionPipeline`] splits documents with a [`Chunker`], then walks
//! the chunk list in batches of `batch_size`. Each batch is embedded and
//! upserted with bounded retries; the outcome of every batch is recorded in
//! an [`IngestReport`] so a partial failure never goes unnoticed.
//!
//! # Example
//!
//! ```rust,ignore
//! use docchat_rag::{IngestionPipeline, RagConfig, InMemoryVectorStore, FixedSizeChunker};
//!
//! let pipeline = IngestionPipeline::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(my_embedder))
//!     .vector_store(Arc::new(InMemoryVectorStore::new()))
//!     .chunker(Arc::new(FixedSizeChunker::new(512, 64, ChunkUnit::Chars)?))
//!     .build()?;
//!
//! let report = pipeline.ingest("docs", &documents, &CancellationToken::new()).await?;
//! assert!(report.is_success());
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunking::Chunker;
use crate::config::RagConfig;
use crate::document::{Chunk, Document};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result, ServiceErrorKind};
use crate::retry::retry_counted;
use crate::vectorstore::VectorStore;

/// What ingestion does once a batch has failed for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failed batch and carry on with the next one.
    #[default]
    Continue,
    /// Stop at the first failed batch; later batches are skipped.
    Abort,
}

/// Final state of one ingestion batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    /// Embedded and stored.
    Committed,
    /// Gave up after retries, or on a non-retryable error.
    Failed {
        /// Service classification, when the failure came from a service.
        kind: Option<ServiceErrorKind>,
        message: String,
    },
    /// Never attempted because the run was cancelled or aborted.
    Skipped,
}

/// The outcome of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// Zero-based batch position.
    pub index: usize,
    /// Chunks in the batch.
    pub chunk_count: usize,
    /// Service calls made for the batch, retries included.
    pub attempts: u32,
    pub status: BatchStatus,
}

impl BatchOutcome {
    fn skipped(index: usize, chunk_count: usize) -> Self {
        Self { index, chunk_count, attempts: 0, status: BatchStatus::Skipped }
    }
}

/// Summary of an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    /// Chunks produced from the input documents.
    pub total_chunks: usize,
    /// One outcome per batch, in batch order.
    pub batches: Vec<BatchOutcome>,
    /// Whether the run was cancelled before every batch was attempted.
    pub cancelled: bool,
}

impl IngestReport {
    /// True when every batch was committed and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.batches.iter().all(|b| b.status == BatchStatus::Committed)
    }

    /// Number of chunks that reached the vector store.
    pub fn committed_chunks(&self) -> usize {
        self.batches.iter().filter(|b| b.status == BatchStatus::Committed).map(|b| b.chunk_count).sum()
    }

    /// Batches that failed.
    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.batches.iter().filter(|b| matches!(b.status, BatchStatus::Failed { .. }))
    }

    /// Batches that were never attempted.
    pub fn skipped_batches(&self) -> usize {
        self.batches.iter().filter(|b| b.status == BatchStatus::Skipped).count()
    }
}

/// Runs chunk → embed → upsert over a set of documents.
///
/// Construct one via [`IngestionPipeline::builder()`].
pub struct IngestionPipeline {
    config: RagConfig,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<dyn VectorStore>,
    chunker: Arc<dyn Chunker>,
}

impl IngestionPipeline {
    /// Create a new [`IngestionPipelineBuilder`].
    pub fn builder() -> IngestionPipelineBuilder {
        IngestionPipelineBuilder::default()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Split `documents` into chunks, in document order.
    pub fn chunk_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        documents.iter().flat_map(|document| self.chunker.chunk(document)).collect()
    }

    /// Ingest `documents` into `collection`.
    ///
    /// Batches run sequentially. `cancel` is checked between batches: the
    /// batch in flight completes and every later batch is reported as
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Ingestion`] when there is nothing to ingest. Batch
    /// failures are not errors; they are recorded in the report.
    pub async fn ingest(
        &self,
        collection: &str,
        documents: &[Document],
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        if documents.is_empty() {
            return Err(RagError::Ingestion("no documents to ingest".to_string()));
        }

        let mut chunks = self.chunk_documents(documents);
        if chunks.is_empty() {
            return Err(RagError::Ingestion("documents contain no text to ingest".to_string()));
        }

        let batch_size = self.config.batch_size.max(1);
        let total_chunks = chunks.len();
        let batch_count = total_chunks.div_ceil(batch_size);
        info!(
            collection,
            documents = documents.len(),
            total_chunks,
            batch_size,
            batch_count,
            "starting ingestion"
        );

        let mut report = IngestReport { total_chunks, batches: Vec::with_capacity(batch_count), cancelled: false };
        let mut halted = false;

        for (index, batch) in chunks.chunks_mut(batch_size).enumerate() {
            if halted {
                report.batches.push(BatchOutcome::skipped(index, batch.len()));
                continue;
            }
            if cancel.is_cancelled() {
                warn!(collection, batch = index, "ingestion cancelled, skipping remaining batches");
                report.cancelled = true;
                halted = true;
                report.batches.push(BatchOutcome::skipped(index, batch.len()));
                continue;
            }

            if index > 0 && !self.config.batch_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.batch_delay) => {}
                    _ = cancel.cancelled() => {}
                }
                if cancel.is_cancelled() {
                    warn!(collection, batch = index, "ingestion cancelled, skipping remaining batches");
                    report.cancelled = true;
                    halted = true;
                    report.batches.push(BatchOutcome::skipped(index, batch.len()));
                    continue;
                }
            }

            let outcome = self.ingest_batch(collection, index, batch).await;
            if let BatchStatus::Failed { kind, message } = &outcome.status {
                error!(
                    collection,
                    batch = index,
                    chunk_count = outcome.chunk_count,
                    attempts = outcome.attempts,
                    kind = ?kind,
                    error = %message,
                    "batch failed"
                );
                if self.config.failure_policy == FailurePolicy::Abort {
                    halted = true;
                }
            } else {
                debug!(collection, batch = index, chunk_count = outcome.chunk_count, "batch committed");
            }
            report.batches.push(outcome);
        }

        info!(
            collection,
            total_chunks,
            committed_chunks = report.committed_chunks(),
            failed_batches = report.failed_batches().count(),
            skipped_batches = report.skipped_batches(),
            cancelled = report.cancelled,
            "ingestion finished"
        );
        Ok(report)
    }

    async fn ingest_batch(&self, collection: &str, index: usize, batch: &mut [Chunk]) -> BatchOutcome {
        let chunk_count = batch.len();
        let retry = &self.config.retry;
        let failed = |attempts: u32, e: RagError| BatchOutcome {
            index,
            chunk_count,
            attempts,
            status: BatchStatus::Failed { kind: e.service_kind(), message: e.to_string() },
        };

        let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
        let (embedded, embed_attempts) =
            retry_counted(retry, "embed batch", || self.embedding_provider.embed_batch(&texts)).await;
        let embeddings = match embedded {
            Ok(embeddings) => embeddings,
            Err(e) => return failed(embed_attempts, e),
        };

        let dimensions = self.embedding_provider.dimensions();
        if embeddings.len() != chunk_count || embeddings.iter().any(|e| e.len() != dimensions) {
            let e = RagError::Embedding {
                provider: self.embedding_provider.name().to_string(),
                kind: ServiceErrorKind::Malformed,
                message: format!("expected {chunk_count} embeddings of {dimensions} dimensions"),
            };
            return failed(embed_attempts, e);
        }
        for (chunk, embedding) in batch.iter_mut().zip(embeddings) {
            chunk.embedding = embedding;
        }

        let batch: &[Chunk] = batch;
        let (stored, upsert_attempts) =
            retry_counted(retry, "upsert batch", || self.vector_store.upsert(collection, batch)).await;
        let attempts = embed_attempts + upsert_attempts;
        match stored {
            Ok(()) => BatchOutcome { index, chunk_count, attempts, status: BatchStatus::Committed },
            Err(e) => failed(attempts, e),
        }
    }
}

/// Builder for constructing an [`IngestionPipeline`].
///
/// All fields are required.
#[derive(Default)]
pub struct IngestionPipelineBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    chunker: Option<Arc<dyn Chunker>>,
}

impl IngestionPipelineBuilder {
    /// Set the pipeline configuration.
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Set the vector store backend.
    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// Set the document chunker.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Build the [`IngestionPipeline`], validating that all fields are set.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if any field is missing.
    pub fn build(self) -> Result<IngestionPipeline> {
        let config = self.config.ok_or_else(|| RagError::Config("config is required".to_string()))?;
        let embedding_provider = self
            .embedding_provider
            .ok_or_else(|| RagError::Config("embedding_provider is required".to_string()))?;
        let vector_store =
            self.vector_store.ok_or_else(|| RagError::Config("vector_store is required".to_string()))?;
        let chunker = self.chunker.ok_or_else(|| RagError::Config("chunker is required".to_string()))?;

        Ok(IngestionPipeline { config, embedding_provider, vector_store, chunker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: usize, status: BatchStatus) -> BatchOutcome {
        BatchOutcome { index, chunk_count: 2, attempts: 1, status }
    }

    #[test]
    fn report_success_requires_every_batch_committed() {
        let mut report = IngestReport {
            total_chunks: 4,
            batches: vec![outcome(0, BatchStatus::Committed), outcome(1, BatchStatus::Committed)],
            cancelled: false,
        };
        assert!(report.is_success());
        assert_eq!(report.committed_chunks(), 4);

        report.batches[1].status =
            BatchStatus::Failed { kind: Some(ServiceErrorKind::RateLimited), message: "429".into() };
        assert!(!report.is_success());
        assert_eq!(report.failed_batches().count(), 1);
        assert_eq!(report.committed_chunks(), 2);
    }

    #[test]
    fn cancelled_report_is_not_success() {
        let report = IngestReport {
            total_chunks: 2,
            batches: vec![outcome(0, BatchStatus::Committed)],
            cancelled: true,
        };
        assert!(!report.is_success());
    }

    #[test]
    fn builder_requires_every_component() {
        let err = IngestionPipeline::builder().config(RagConfig::default()).build().err().unwrap();
        assert!(matches!(err, RagError::Config(message) if message.contains("embedding_provider")));
    }

    #[test]
    fn batch_status_serializes_with_tag() {
        let json = serde_json::to_value(outcome(3, BatchStatus::Skipped)).unwrap();
        assert_eq!(json["status"]["state"], "skipped");
        assert_eq!(json["index"], 3);
    }
}
