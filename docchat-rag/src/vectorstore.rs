//! Vector store trait for storing and searching vector embeddings.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::document::{Chunk, SearchResult};
use crate::error::{RagError, Result};

/// A storage backend for vector embeddings with similarity search.
///
/// Implementations manage named collections of [`Chunk`]s and support
/// upserting, deleting, and searching by cosine similarity.
///
/// # Example
///
/// ```rust,ignore
/// use docchat_rag::{VectorStore, InMemoryVectorStore};
///
/// let store = InMemoryVectorStore::new();
/// store.create_collection("docs", 384).await?;
/// store.upsert("docs", &chunks).await?;
/// let results = store.search("docs", &query_embedding, 5, false).await?;
/// ```
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create a named collection. No-op if it already exists.
    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<()>;

    /// Vector size of an existing collection, or `None` if it does not exist.
    async fn collection_dimensions(&self, name: &str) -> Result<Option<usize>>;

    /// Delete a named collection and all its data.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Upsert chunks into a collection. Chunks must have embeddings set.
    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<()>;

    /// Delete chunks by their IDs from a collection.
    async fn delete(&self, collection: &str, ids: &[&str]) -> Result<()>;

    /// Search for the `top_k` most similar chunks to the given embedding.
    ///
    /// Returns results ordered by descending similarity score. When
    /// `with_vectors` is set the returned chunks carry their stored embedding.
    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        with_vectors: bool,
    ) -> Result<Vec<SearchResult>>;

    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;
}

/// Make sure `collection` exists with `dimensions`-long vectors.
///
/// Creates the collection when it is missing.
///
/// # Errors
///
/// Returns [`RagError::Config`] if the collection exists with a different
/// vector size: the configured embedding deployment does not match the one
/// the collection was built with.
pub async fn ensure_collection(
    store: &dyn VectorStore,
    collection: &str,
    dimensions: usize,
) -> Result<()> {
    match store.collection_dimensions(collection).await? {
        Some(existing) if existing == dimensions => Ok(()),
        Some(existing) => {
            warn!(collection, existing, dimensions, "collection dimension mismatch");
            Err(RagError::Config(format!(
                "collection '{collection}' stores {existing}-dimensional vectors but the embedding \
                 deployment produces {dimensions}; re-ingest with --recreate or fix EMBEDDING_DIMENSIONS"
            )))
        }
        None => {
            store.create_collection(collection, dimensions).await?;
            info!(collection, dimensions, backend = store.name(), "created collection");
            Ok(())
        }
    }
}

/// Drop `collection` if present and create it again, empty.
pub async fn recreate_collection(
    store: &dyn VectorStore,
    collection: &str,
    dimensions: usize,
) -> Result<()> {
    if store.collection_dimensions(collection).await?.is_some() {
        store.delete_collection(collection).await?;
        info!(collection, backend = store.name(), "deleted collection for recreation");
    }
    store.create_collection(collection, dimensions).await?;
    info!(collection, dimensions, backend = store.name(), "created collection");
    Ok(())
}
