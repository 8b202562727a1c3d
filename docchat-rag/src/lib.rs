//! Retrieval-augmented question answering over a single document.
//!
//! This crate provides:
//! - PDF and text loading with parallel page extraction
//! - Fixed-size overlapping chunking with deterministic chunk ids
//! - Azure OpenAI embedding and chat adapters
//! - Qdrant and in-memory vector stores
//! - Batched, retrying ingestion with a per-batch report
//! - Similarity and MMR retrieval, prompt templates and the answering chain
//! - Environment-driven [`Settings`]

pub mod azure;
pub mod chain;
pub mod chunking;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
mod http;
pub mod inmemory;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod mmr;
pub mod pipeline;
pub mod prompt;
pub mod qdrant;
pub mod retrieval;
pub mod retry;
pub mod settings;
pub mod vectorstore;

pub use azure::{AzureOpenAIChatModel, AzureOpenAIConfig, AzureOpenAIEmbeddingProvider};
pub use chain::{Answer, AnswerStream, RagChain, RagChainBuilder, validate_question};
pub use chunking::{ChunkUnit, Chunker, FixedSizeChunker, chunk_id, reassemble};
pub use config::{RagConfig, RagConfigBuilder};
pub use document::{Chunk, Document, SearchResult};
pub use embedding::EmbeddingProvider;
pub use error::{RagError, Result, ServiceErrorKind};
pub use http::{classify_status, classify_transport};
pub use inmemory::InMemoryVectorStore;
pub use ingest::{IngestOptions, Ingestor};
pub use llm::{CompletionModel, CompletionStream, Message, Role};
pub use loader::{DocumentLoader, PdfLoader, TextLoader, loader_for_path};
pub use pipeline::{BatchOutcome, BatchStatus, FailurePolicy, IngestReport, IngestionPipeline};
pub use prompt::{PromptTemplate, PromptTemplates, format_context};
pub use qdrant::QdrantVectorStore;
pub use retrieval::{SearchKind, SearchStrategy, retrieve};
pub use retry::RetryPolicy;
pub use settings::{Secret, Settings};
pub use vectorstore::{VectorStore, ensure_collection, recreate_collection};

/// Re-exported so callers can cancel ingestion without naming `tokio-util`.
pub use tokio_util::sync::CancellationToken;
