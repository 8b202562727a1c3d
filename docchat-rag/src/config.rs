//! Tunables for ingestion and retrieval.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunking::ChunkUnit;
use crate::error::{RagError, Result};
use crate::pipeline::FailurePolicy;
use crate::retrieval::SearchStrategy;
use crate::retry::RetryPolicy;

/// Configuration parameters for the ingestion pipeline and the RAG chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagConfig {
    /// Maximum chunk size in units.
    pub chunk_size: usize,
    /// Number of overlapping units between consecutive chunks.
    pub chunk_overlap: usize,
    /// Unit chunk sizes are measured in.
    pub chunk_unit: ChunkUnit,
    /// Chunks embedded and upserted per ingestion batch.
    pub batch_size: usize,
    /// Maximum inputs per embedding HTTP request.
    pub embedding_request_size: usize,
    /// Dimensionality of the embedding deployment and of the collection.
    pub embedding_dimensions: usize,
    /// Number of results handed to the prompt.
    pub top_k: usize,
    /// How the vector index is searched.
    pub search_strategy: SearchStrategy,
    /// Minimum similarity score for results (results below this are filtered out).
    pub similarity_threshold: f32,
    /// Upper bound on PDF page-extraction workers.
    pub max_workers: usize,
    /// Retry policy for retryable service errors.
    pub retry: RetryPolicy,
    /// What ingestion does after a batch fails for good.
    pub failure_policy: FailurePolicy,
    /// Pause between ingestion batches.
    pub batch_delay: Duration,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2048,
            chunk_overlap: 0,
            chunk_unit: ChunkUnit::Chars,
            batch_size: 2,
            embedding_request_size: 1000,
            embedding_dimensions: 1536,
            top_k: 10,
            search_strategy: SearchStrategy::default(),
            similarity_threshold: 0.0,
            max_workers: 8,
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::Continue,
            batch_delay: Duration::from_millis(100),
        }
    }
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Set the maximum chunk size in units.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in units.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the unit chunk sizes are measured in.
    pub fn chunk_unit(mut self, unit: ChunkUnit) -> Self {
        self.config.chunk_unit = unit;
        self
    }

    /// Set the number of chunks per ingestion batch.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the maximum number of inputs per embedding request.
    pub fn embedding_request_size(mut self, size: usize) -> Self {
        self.config.embedding_request_size = size;
        self
    }

    /// Set the embedding dimensionality.
    pub fn embedding_dimensions(mut self, dimensions: usize) -> Self {
        self.config.embedding_dimensions = dimensions;
        self
    }

    /// Set the number of top results to return from vector search.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set the search strategy.
    pub fn search_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.config.search_strategy = strategy;
        self
    }

    /// Set the minimum similarity threshold for filtering results.
    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.similarity_threshold = threshold;
        self
    }

    /// Set the maximum number of PDF extraction workers.
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    /// Set the retry policy for external calls.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set what ingestion does after a batch fails.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    /// Set the pause between ingestion batches.
    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.config.batch_delay = delay;
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Chunking`] if `chunk_size == 0` or
    /// `chunk_overlap >= chunk_size`, and [`RagError::Config`] if:
    /// - `top_k`, `batch_size`, `embedding_request_size`, `embedding_dimensions`
    ///   or `max_workers` is zero
    /// - the MMR lambda is outside `[0, 1]`
    /// - the similarity threshold is not finite
    pub fn build(self) -> Result<RagConfig> {
        let config = self.config;
        if config.chunk_size == 0 {
            return Err(RagError::Chunking("chunk_size must be greater than zero".to_string()));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(RagError::Chunking(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                config.chunk_overlap, config.chunk_size
            )));
        }
        for (name, value) in [
            ("top_k", config.top_k),
            ("batch_size", config.batch_size),
            ("embedding_request_size", config.embedding_request_size),
            ("embedding_dimensions", config.embedding_dimensions),
            ("max_workers", config.max_workers),
        ] {
            if value == 0 {
                return Err(RagError::Config(format!("{name} must be greater than zero")));
            }
        }
        if let SearchStrategy::Mmr { lambda, .. } = config.search_strategy {
            if !(0.0..=1.0).contains(&lambda) {
                return Err(RagError::Config(format!("MMR lambda ({lambda}) must be within [0, 1]")));
            }
        }
        if !config.similarity_threshold.is_finite() {
            return Err(RagError::Config("similarity_threshold must be a finite number".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let built = RagConfig::builder().build().unwrap();
        assert_eq!(built, RagConfig::default());
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let err = RagConfig::builder().chunk_size(100).chunk_overlap(100).build().unwrap_err();
        assert!(matches!(err, RagError::Chunking(_)));
    }

    #[test]
    fn zero_counts_are_rejected() {
        let err = RagConfig::builder().top_k(0).build().unwrap_err();
        assert!(err.to_string().contains("top_k"));
        let err = RagConfig::builder().batch_size(0).build().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn mmr_lambda_is_bounded() {
        let err = RagConfig::builder()
            .search_strategy(SearchStrategy::Mmr { fetch_k: 20, lambda: 1.5 })
            .build()
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }
}
