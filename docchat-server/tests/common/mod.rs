//! Offline stand-ins for the embedding, completion and settings sources.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use docchat_rag::document::{PAGE_KEY, SOURCE_KEY};
use docchat_rag::{
    Chunk, CompletionModel, CompletionStream, EmbeddingProvider, InMemoryVectorStore, Message, PromptTemplates,
    RagChain, RagConfig, RagError, Result, RetryPolicy, SearchStrategy, ServiceErrorKind,
    VectorStore,
};
use docchat_server::{AppState, ChainCache, ChainFactory, app_router};
use tokio::sync::Notify;

pub const DIM: usize = 3;
pub const COLLECTION: &str = "manual";
pub const ANSWER: &str = "Run setup.exe from the install folder.";

pub struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lower = text.to_lowercase();
        Ok(if lower.contains("install") {
            vec![1.0, 0.0, 0.0]
        } else if lower.contains("license") {
            vec![0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 1.0]
        })
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

/// Fails with `kind` while `failures` is positive, then answers.
pub struct CannedModel {
    pub failures: AtomicUsize,
    pub kind: ServiceErrorKind,
    pub calls: AtomicUsize,
}

impl CannedModel {
    pub fn new(failures: usize, kind: ServiceErrorKind) -> Self {
        Self { failures: AtomicUsize::new(failures), kind, calls: AtomicUsize::new(0) }
    }

    pub fn healthy() -> Self {
        Self::new(0, ServiceErrorKind::Timeout)
    }
}

#[async_trait]
impl CompletionModel for CannedModel {
    async fn complete(&self, _messages: &[Message]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RagError::Completion {
                provider: "canned".into(),
                kind: self.kind,
                message: "upstream said: key sk-live-1234 rejected".into(),
            });
        }
        Ok(ANSWER.to_string())
    }

    /// Streams the canned answer word by word.
    async fn complete_stream(&self, messages: &[Message]) -> Result<CompletionStream> {
        let text = self.complete(messages).await?;
        let words: Vec<Result<String>> = text.split_inclusive(' ').map(|w| Ok(w.to_string())).collect();
        Ok(Box::pin(stream::iter(words)))
    }

    fn name(&self) -> &str {
        "canned"
    }
}

fn chunk(id: &str, text: &str, page: &str, embedding: Vec<f32>) -> Chunk {
    let mut metadata = HashMap::new();
    metadata.insert(SOURCE_KEY.to_string(), "manual.pdf".to_string());
    metadata.insert(PAGE_KEY.to_string(), page.to_string());
    Chunk {
        id: id.to_string(),
        text: text.to_string(),
        embedding,
        metadata,
        document_id: format!("manual-p{page}"),
        start: 0,
        end: text.len(),
        overlap: 0,
    }
}

pub async fn indexed_store() -> Arc<InMemoryVectorStore> {
    let store = Arc::new(InMemoryVectorStore::new());
    store.create_collection(COLLECTION, DIM).await.unwrap();
    store
        .upsert(
            COLLECTION,
            &[
                chunk("install", "Installation: run setup.exe.", "2", vec![1.0, 0.0, 0.0]),
                chunk("license", "Licensed under Apache-2.0.", "9", vec![0.0, 1.0, 0.0]),
            ],
        )
        .await
        .unwrap();
    store
}

/// Builds chains over a fixed store; the system prompt stands in for the
/// editable configuration.
pub struct TestFactory {
    pub store: Arc<InMemoryVectorStore>,
    pub model: Arc<CannedModel>,
    pub system_prompt: Mutex<String>,
    pub builds: AtomicUsize,
    pub fail_builds: AtomicBool,
    /// While set, builds wait for `release` before finishing.
    pub hold_builds: AtomicBool,
    pub release: Notify,
}

impl TestFactory {
    pub fn new(store: Arc<InMemoryVectorStore>, model: Arc<CannedModel>) -> Self {
        Self {
            store,
            model,
            system_prompt: Mutex::new("Answer only from the manual.".to_string()),
            builds: AtomicUsize::new(0),
            fail_builds: AtomicBool::new(false),
            hold_builds: AtomicBool::new(false),
            release: Notify::new(),
        }
    }

    pub fn set_system_prompt(&self, text: &str) {
        *self.system_prompt.lock().unwrap() = text.to_string();
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainFactory for TestFactory {
    async fn fingerprint(&self) -> Result<String> {
        Ok(self.system_prompt.lock().unwrap().clone())
    }

    async fn build(&self) -> Result<RagChain> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.hold_builds.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(RagError::Config("collection 'manual' is unreachable".into()));
        }
        let system = self.system_prompt.lock().unwrap().clone();
        let config = RagConfig::builder()
            .embedding_dimensions(DIM)
            .top_k(2)
            .search_strategy(SearchStrategy::Similarity)
            .retry(RetryPolicy {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            })
            .build()?;
        let chain = RagChain::builder()
            .config(config)
            .embedding_provider(Arc::new(KeywordEmbedder))
            .vector_store(self.store.clone())
            .completion_model(self.model.clone())
            .templates(PromptTemplates::new(&system, "Context:\n{context}\n\nQuestion: {query}")?)
            .collection(COLLECTION)
            .build()?;
        chain.verify().await?;
        Ok(chain)
    }
}

pub async fn spawn_server(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });
    (format!("http://{}", addr), handle)
}

pub fn state_for(factory: Arc<TestFactory>) -> AppState {
    AppState::new(Arc::new(ChainCache::new(factory)))
}
