//! In-memory vector store using cosine similarity.
//!
//! This module provides [`InMemoryVectorStore`], a vector store backed by a
//! `HashMap` protected by a `tokio::sync::RwLock`. It is the reference
//! implementation for tests and offline runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::document::{Chunk, SearchResult};
use crate::error::{RagError, Result, ServiceErrorKind};
use crate::mmr::cosine_similarity;
use crate::vectorstore::VectorStore;

const BACKEND: &str = "in-memory";

#[derive(Debug, Default)]
struct Collection {
    dimensions: usize,
    chunks: HashMap<String, Chunk>,
}

/// An in-memory vector store using cosine similarity for search.
///
/// Collections are stored as nested `HashMap`s: collection name → chunk ID → chunk.
/// All operations are async-safe via `tokio::sync::RwLock`.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    /// Create a new empty in-memory vector store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks stored in `collection`.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections.read().await.get(collection).map_or(0, |c| c.chunks.len())
    }

    /// Whether `collection` is missing or empty.
    pub async fn is_empty(&self, collection: &str) -> bool {
        self.len(collection).await == 0
    }
}

fn missing(collection: &str) -> RagError {
    RagError::VectorStore {
        backend: BACKEND.to_string(),
        kind: ServiceErrorKind::Malformed,
        message: format!("collection '{collection}' does not exist"),
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections
            .entry(name.to_string())
            .or_insert_with(|| Collection { dimensions, chunks: HashMap::new() });
        Ok(())
    }

    async fn collection_dimensions(&self, name: &str) -> Result<Option<usize>> {
        Ok(self.collections.read().await.get(name).map(|c| c.dimensions))
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections.remove(name);
        Ok(())
    }

    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<()> {
        let mut collections = self.collections.write().await;
        let store = collections.get_mut(collection).ok_or_else(|| missing(collection))?;
        if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != store.dimensions) {
            return Err(RagError::VectorStore {
                backend: BACKEND.to_string(),
                kind: ServiceErrorKind::Malformed,
                message: format!(
                    "chunk '{}' has {} dimensions, collection '{collection}' expects {}",
                    bad.id,
                    bad.embedding.len(),
                    store.dimensions
                ),
            });
        }
        for chunk in chunks {
            store.chunks.insert(chunk.id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[&str]) -> Result<()> {
        let mut collections = self.collections.write().await;
        let store = collections.get_mut(collection).ok_or_else(|| missing(collection))?;
        for id in ids {
            store.chunks.remove(*id);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        with_vectors: bool,
    ) -> Result<Vec<SearchResult>> {
        let collections = self.collections.read().await;
        let store = collections.get(collection).ok_or_else(|| missing(collection))?;

        let mut scored: Vec<SearchResult> = store
            .chunks
            .values()
            .map(|chunk| {
                let score = cosine_similarity(&chunk.embedding, embedding);
                let mut chunk = chunk.clone();
                if !with_vectors {
                    chunk.embedding = Vec::new();
                }
                SearchResult { chunk, score }
            })
            .collect();

        // Ties broken by id so equal scores come back in a stable order.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    fn name(&self) -> &str {
        BACKEND
    }
}
