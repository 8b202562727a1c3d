//! The top-level ingestion operation: file → collection.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::chunking::FixedSizeChunker;
use crate::config::RagConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::loader::loader_for_path;
use crate::pipeline::{IngestReport, IngestionPipeline};
use crate::retry::retry;
use crate::vectorstore::{VectorStore, ensure_collection, recreate_collection};

/// Text embedded once to learn the deployment's vector size.
const SAMPLE_TEXT: &str = "test";

/// Per-run ingestion switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Drop and recreate the collection before ingesting.
    pub recreate: bool,
}

/// Loads a source file and ingests it into one collection.
pub struct Ingestor {
    config: RagConfig,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<dyn VectorStore>,
    collection: String,
}

impl Ingestor {
    pub fn new(
        config: RagConfig,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        vector_store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
    ) -> Self {
        Self { config, embedding_provider, vector_store, collection: collection.into() }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Embed a sample text and check the vector size against the configuration.
    pub async fn measure_dimensions(&self) -> Result<usize> {
        let provider = &self.embedding_provider;
        let vector = retry(&self.config.retry, "sample embedding", || provider.embed(SAMPLE_TEXT)).await?;
        if vector.len() != self.config.embedding_dimensions {
            return Err(RagError::Config(format!(
                "embedding deployment '{}' produces {}-dimensional vectors but EMBEDDING_DIMENSIONS is {}",
                provider.name(),
                vector.len(),
                self.config.embedding_dimensions
            )));
        }
        Ok(vector.len())
    }

    /// Load `path`, prepare the collection and ingest every chunk.
    ///
    /// # Errors
    ///
    /// Loading, chunker, dimension check and collection failures abort the run before
    /// any chunk is written. Failed batches are reported, not raised.
    #[instrument(skip_all, fields(path = %path.display(), collection = %self.collection))]
    pub async fn ingest_source(
        &self,
        path: &Path,
        options: IngestOptions,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let chunker =
            FixedSizeChunker::new(self.config.chunk_size, self.config.chunk_overlap, self.config.chunk_unit)?;

        let loader = loader_for_path(path, self.config.max_workers)?;
        let started = Instant::now();
        let documents = loader.load(path).await?;
        info!(documents = documents.len(), elapsed_ms = started.elapsed().as_millis() as u64, "loaded source");

        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        let dimensions = self.measure_dimensions().await?;
        if options.recreate {
            recreate_collection(self.vector_store.as_ref(), &self.collection, dimensions).await?;
        } else {
            ensure_collection(self.vector_store.as_ref(), &self.collection, dimensions).await?;
        }

        let pipeline = IngestionPipeline::builder()
            .config(self.config.clone())
            .embedding_provider(Arc::clone(&self.embedding_provider))
            .vector_store(Arc::clone(&self.vector_store))
            .chunker(Arc::new(chunker))
            .build()?;

        let upload_started = Instant::now();
        let report = pipeline.ingest(&self.collection, &documents, cancel).await?;
        let elapsed = upload_started.elapsed();
        let per_chunk_ms = elapsed.as_secs_f64() * 1000.0 / report.total_chunks.max(1) as f64;
        info!(
            total_chunks = report.total_chunks,
            committed_chunks = report.committed_chunks(),
            success = report.is_success(),
            elapsed_secs = elapsed.as_secs_f64(),
            per_chunk_ms,
            "processing complete"
        );
        Ok(report)
    }
}
