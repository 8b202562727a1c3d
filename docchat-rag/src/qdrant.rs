//! Qdrant vector store backend.
//!
//! Provides [`QdrantVectorStore`], which implements [`VectorStore`] against
//! the Qdrant REST API with `reqwest`. Collections use cosine distance with
//! binary quantization kept on disk, and chunk text, offsets and metadata
//! travel as point payload.
//!
//! # Example
//!
//! ```rust,ignore
//! use docchat_rag::qdrant::QdrantVectorStore;
//!
//! let store = QdrantVectorStore::new("http://localhost:6333", None, Duration::from_secs(60))?;
//! store.create_collection("docs", 1536).await?;
//! store.upsert("docs", &chunks).await?;
//! let results = store.search("docs", &query_embedding, 5, false).await?;
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::document::{Chunk, SearchResult};
use crate::error::{RagError, Result, ServiceErrorKind};
use crate::http::{HttpFailure, build_client, send_json, send_json_optional};
use crate::vectorstore::VectorStore;

const BACKEND: &str = "qdrant";

/// A [`VectorStore`] backed by [Qdrant](https://qdrant.tech/) over REST.
pub struct QdrantVectorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for QdrantVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantVectorStore")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl QdrantVectorStore {
    /// Create a store talking to the Qdrant instance at `url`.
    ///
    /// `api_key` is sent as the `api-key` header when present.
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RagError::Config("Qdrant URL must not be empty".into()));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(RagError::Config(format!(
                "Qdrant URL '{base_url}' must start with http:// or https://"
            )));
        }
        let client = build_client(timeout)
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {e}")))?;
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        Ok(Self { client, base_url, api_key })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    fn map_err(operation: &str, failure: HttpFailure) -> RagError {
        error!(backend = BACKEND, operation, kind = %failure.kind, "qdrant request failed");
        RagError::VectorStore {
            backend: BACKEND.to_string(),
            kind: failure.kind,
            message: format!("{operation}: {}", failure.message),
        }
    }
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateCollection {
    vectors: VectorParams,
    on_disk_payload: bool,
    quantization_config: QuantizationConfig,
}

impl CreateCollection {
    fn cosine(size: usize) -> Self {
        Self {
            vectors: VectorParams { size, distance: "Cosine" },
            on_disk_payload: true,
            quantization_config: QuantizationConfig { binary: BinaryQuantization { always_ram: false } },
        }
    }
}

#[derive(Serialize)]
struct QuantizationConfig {
    binary: BinaryQuantization,
}

#[derive(Serialize)]
struct BinaryQuantization {
    always_ram: bool,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: &'static str,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct PointPayload {
    text: String,
    document_id: String,
    #[serde(default)]
    start: usize,
    #[serde(default)]
    end: usize,
    #[serde(default)]
    overlap: usize,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Serialize)]
struct Point<'a> {
    id: &'a str,
    vector: &'a [f32],
    payload: PointPayload,
}

#[derive(Serialize)]
struct UpsertPoints<'a> {
    points: Vec<Point<'a>>,
}

#[derive(Serialize)]
struct DeletePoints<'a> {
    points: &'a [&'a str],
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: Value,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<PointPayload>,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

fn point_payload(chunk: &Chunk) -> PointPayload {
    PointPayload {
        text: chunk.text.clone(),
        document_id: chunk.document_id.clone(),
        start: chunk.start,
        end: chunk.end,
        overlap: chunk.overlap,
        metadata: chunk.metadata.clone(),
    }
}

/// Vector size from a collection's `vectors` config.
///
/// Only the single unnamed vector layout is understood.
fn vector_size(vectors: &Value) -> Option<usize> {
    vectors.get("size").and_then(Value::as_u64).map(|s| s as usize)
}

fn point_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn into_search_result(point: ScoredPoint) -> Result<SearchResult> {
    let id = point_id(&point.id);
    let payload = point.payload.ok_or_else(|| RagError::VectorStore {
        backend: BACKEND.to_string(),
        kind: ServiceErrorKind::Malformed,
        message: format!("point '{id}' has no payload"),
    })?;
    Ok(SearchResult {
        chunk: Chunk {
            id,
            text: payload.text,
            embedding: point.vector.unwrap_or_default(),
            metadata: payload.metadata,
            document_id: payload.document_id,
            start: payload.start,
            end: payload.end,
            overlap: payload.overlap,
        },
        score: point.score,
    })
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<()> {
        if self.collection_dimensions(name).await?.is_some() {
            debug!(collection = name, "qdrant collection already exists, skipping creation");
            return Ok(());
        }

        let body = CreateCollection::cosine(dimensions);
        let _: Envelope<Value> =
            send_json(self.authed(self.client.put(self.url(&format!("collections/{name}")))).json(&body))
                .await
                .map_err(|f| Self::map_err("create collection", f))?;

        debug!(collection = name, dimensions, "created qdrant collection");
        Ok(())
    }

    async fn collection_dimensions(&self, name: &str) -> Result<Option<usize>> {
        let info: Option<Envelope<CollectionInfo>> =
            send_json_optional(self.authed(self.client.get(self.url(&format!("collections/{name}")))))
                .await
                .map_err(|f| Self::map_err("get collection", f))?;

        match info {
            None => Ok(None),
            Some(info) => vector_size(&info.result.config.params.vectors).map(Some).ok_or_else(|| {
                RagError::VectorStore {
                    backend: BACKEND.to_string(),
                    kind: ServiceErrorKind::Malformed,
                    message: format!("collection '{name}' does not use a single unnamed vector"),
                }
            }),
        }
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let _: Option<Envelope<Value>> =
            send_json_optional(self.authed(self.client.delete(self.url(&format!("collections/{name}")))))
                .await
                .map_err(|f| Self::map_err("delete collection", f))?;
        debug!(collection = name, "deleted qdrant collection");
        Ok(())
    }

    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let points = chunks
            .iter()
            .map(|chunk| Point { id: &chunk.id, vector: &chunk.embedding, payload: point_payload(chunk) })
            .collect();
        let url = self.url(&format!("collections/{collection}/points?wait=true"));
        let _: Envelope<Value> = send_json(self.authed(self.client.put(url)).json(&UpsertPoints { points }))
            .await
            .map_err(|f| Self::map_err("upsert points", f))?;

        debug!(collection, count = chunks.len(), "upserted chunks to qdrant");
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[&str]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let url = self.url(&format!("collections/{collection}/points/delete?wait=true"));
        let _: Envelope<Value> = send_json(self.authed(self.client.post(url)).json(&DeletePoints { points: ids }))
            .await
            .map_err(|f| Self::map_err("delete points", f))?;

        debug!(collection, count = ids.len(), "deleted chunks from qdrant");
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        with_vectors: bool,
    ) -> Result<Vec<SearchResult>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let request = SearchRequest { vector: embedding, limit: top_k, with_payload: true, with_vector: with_vectors };
        let url = self.url(&format!("collections/{collection}/points/search"));
        let response: Envelope<Vec<ScoredPoint>> = send_json(self.authed(self.client.post(url)).json(&request))
            .await
            .map_err(|f| Self::map_err("search points", f))?;

        let results = response.result.into_iter().map(into_search_result).collect::<Result<Vec<_>>>()?;
        debug!(collection, top_k, result_count = results.len(), "qdrant search completed");
        Ok(results)
    }

    fn name(&self) -> &str {
        BACKEND
    }
}
