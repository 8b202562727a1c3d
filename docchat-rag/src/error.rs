//! Error types for the `docchat-rag` crate.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// How an external service call failed.
///
/// Adapters classify every failure into one of these kinds so the pipeline and
/// chain can decide between retrying and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    /// Credentials were rejected (HTTP 401/403).
    Auth,
    /// The service asked us to slow down (HTTP 429).
    RateLimited,
    /// The request did not complete in time.
    Timeout,
    /// The service could not be reached or returned a 5xx.
    Unavailable,
    /// The request or the response did not have the expected shape.
    Malformed,
}

impl ServiceErrorKind {
    /// Whether a failure of this kind may succeed when tried again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::Unavailable)
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Auth => "authentication failed",
            Self::RateLimited => "rate limited",
            Self::Timeout => "timed out",
            Self::Unavailable => "unavailable",
            Self::Malformed => "malformed request or response",
        };
        f.write_str(label)
    }
}

/// Errors that can occur in RAG operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// A configuration value is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required settings are absent.
    #[error("Missing required settings: {}", .0.join(", "))]
    MissingSettings(Vec<String>),

    /// The source document could not be loaded.
    #[error("Failed to load document {}: {message}", path.display())]
    DocumentLoad {
        /// The path that was being loaded.
        path: PathBuf,
        /// A description of the failure.
        message: String,
    },

    /// The chunker was configured with an impossible size/overlap pair.
    #[error("Chunking error: {0}")]
    Chunking(String),

    /// A prompt template is absent or malformed.
    #[error("Template error ({template}): {message}")]
    Template {
        /// The template that failed.
        template: String,
        /// A description of the failure.
        message: String,
    },

    /// Caller supplied input that cannot be processed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An error occurred during embedding generation.
    #[error("Embedding error ({provider}, {kind}): {message}")]
    Embedding {
        /// The embedding provider that produced the error.
        provider: String,
        /// Classification of the failure.
        kind: ServiceErrorKind,
        /// A description of the failure.
        message: String,
    },

    /// An error occurred in the vector store backend.
    #[error("Vector store error ({backend}, {kind}): {message}")]
    VectorStore {
        /// The vector store backend that produced the error.
        backend: String,
        /// Classification of the failure.
        kind: ServiceErrorKind,
        /// A description of the failure.
        message: String,
    },

    /// An error occurred while calling the chat completion service.
    #[error("Completion error ({provider}, {kind}): {message}")]
    Completion {
        /// The completion provider that produced the error.
        provider: String,
        /// Classification of the failure.
        kind: ServiceErrorKind,
        /// A description of the failure.
        message: String,
    },

    /// An ingestion run could not start or finish.
    #[error("Ingestion error: {0}")]
    Ingestion(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Local I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// The service classification, for errors raised by an external adapter.
    pub fn service_kind(&self) -> Option<ServiceErrorKind> {
        match self {
            Self::Embedding { kind, .. }
            | Self::VectorStore { kind, .. }
            | Self::Completion { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether retrying the failed operation may help.
    pub fn is_retryable(&self) -> bool {
        self.service_kind().is_some_and(ServiceErrorKind::is_retryable)
    }

    /// A message that is safe to show an end user.
    ///
    /// Upstream response bodies and credentials never appear here.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidInput(message) => message.clone(),
            Self::Completion { kind, .. } => match kind {
                ServiceErrorKind::RateLimited => {
                    "The assistant is receiving too many requests right now. Please try again in a moment."
                        .to_string()
                }
                ServiceErrorKind::Timeout | ServiceErrorKind::Unavailable => {
                    "The assistant is temporarily unavailable. Please try again shortly.".to_string()
                }
                ServiceErrorKind::Auth | ServiceErrorKind::Malformed => {
                    "The assistant could not answer because of a service configuration problem."
                        .to_string()
                }
            },
            Self::Embedding { kind, .. } | Self::VectorStore { kind, .. } => {
                if kind.is_retryable() {
                    "The knowledge base is temporarily unavailable. Please try again shortly."
                        .to_string()
                } else {
                    "The knowledge base could not be searched because of a service configuration problem."
                        .to_string()
                }
            }
            Self::Cancelled => "The request was cancelled.".to_string(),
            _ => "Something went wrong while answering. Please try again later.".to_string(),
        }
    }
}

/// A convenience result type for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;
