//! Azure OpenAI and Qdrant adapters against a local HTTP listener.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use docchat_rag::azure::{AzureOpenAIChatModel, AzureOpenAIConfig, AzureOpenAIEmbeddingProvider};
use docchat_rag::embedding::EmbeddingProvider;
use docchat_rag::error::{RagError, ServiceErrorKind};
use docchat_rag::llm::{CompletionModel, Message};
use docchat_rag::qdrant::QdrantVectorStore;
use docchat_rag::vectorstore::VectorStore;
use futures::StreamExt;
use serde_json::{Value, json};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server run");
    });
    format!("http://{addr}")
}

/// Answers every request with `status` and an OpenAI-style error body.
async fn failing_service(status: StatusCode) -> String {
    serve(Router::new().fallback(move || async move {
        (status, Json(json!({"error": {"code": status.as_str(), "message": "upstream said no"}})))
    }))
    .await
}

/// Answers every request after five seconds.
async fn slow_service() -> String {
    serve(Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Json(json!({}))
    }))
    .await
}

fn azure(endpoint: &str, deployment: &str) -> AzureOpenAIConfig {
    AzureOpenAIConfig {
        endpoint: endpoint.to_string(),
        api_key: "test-key".to_string(),
        api_version: "2024-08-01-preview".to_string(),
        deployment: deployment.to_string(),
    }
}

fn embedder(endpoint: &str, timeout: Duration) -> AzureOpenAIEmbeddingProvider {
    AzureOpenAIEmbeddingProvider::new(azure(endpoint, "emb"), 3, timeout).unwrap()
}

fn chat(endpoint: &str, timeout: Duration) -> AzureOpenAIChatModel {
    AzureOpenAIChatModel::new(azure(endpoint, "gpt"), timeout).unwrap()
}

fn question() -> Vec<Message> {
    vec![Message::system("Answer from the manual."), Message::user("How do I install it?")]
}

#[tokio::test]
async fn embedding_rate_limit_is_retryable() {
    let base = failing_service(StatusCode::TOO_MANY_REQUESTS).await;
    let err = embedder(&base, TIMEOUT).embed("install").await.unwrap_err();

    assert!(err.is_retryable());
    match err {
        RagError::Embedding { kind, message, .. } => {
            assert_eq!(kind, ServiceErrorKind::RateLimited);
            assert!(message.contains("upstream said no"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn rejected_chat_key_is_an_auth_failure() {
    let base = failing_service(StatusCode::UNAUTHORIZED).await;
    let model = chat(&base, TIMEOUT);

    let err = model.complete(&question()).await.unwrap_err();
    assert!(matches!(err, RagError::Completion { kind: ServiceErrorKind::Auth, .. }));
    assert!(!err.is_retryable());

    let err = model.complete_stream(&question()).await.err().unwrap();
    assert!(matches!(err, RagError::Completion { kind: ServiceErrorKind::Auth, .. }));
}

#[tokio::test]
async fn qdrant_failures_are_classified() {
    let base = failing_service(StatusCode::SERVICE_UNAVAILABLE).await;
    let store = QdrantVectorStore::new(&base, None, TIMEOUT).unwrap();
    let err = store.search("manual", &[1.0, 0.0, 0.0], 3, false).await.unwrap_err();
    assert!(matches!(err, RagError::VectorStore { kind: ServiceErrorKind::Unavailable, .. }));
    assert!(err.is_retryable());

    let base = failing_service(StatusCode::FORBIDDEN).await;
    let store = QdrantVectorStore::new(&base, Some("wrong".into()), TIMEOUT).unwrap();
    let err = store.collection_dimensions("manual").await.unwrap_err();
    assert!(matches!(err, RagError::VectorStore { kind: ServiceErrorKind::Auth, .. }));
}

#[tokio::test]
async fn slow_services_time_out() {
    let base = slow_service().await;
    let short = Duration::from_millis(200);

    let err = embedder(&base, short).embed("install").await.unwrap_err();
    assert!(matches!(err, RagError::Embedding { kind: ServiceErrorKind::Timeout, .. }));

    let err = chat(&base, short).complete(&question()).await.unwrap_err();
    assert!(matches!(err, RagError::Completion { kind: ServiceErrorKind::Timeout, .. }));

    let store = QdrantVectorStore::new(&base, None, short).unwrap();
    let err = store.collection_dimensions("manual").await.unwrap_err();
    assert!(matches!(err, RagError::VectorStore { kind: ServiceErrorKind::Timeout, .. }));
}

const CHAT_EVENTS: &str = concat!(
    "data: {\"choices\":[],\"prompt_filter_results\":[{\"prompt_index\":0}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Run \"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"setup.exe\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
);

#[tokio::test]
async fn chat_stream_yields_deltas_until_done() {
    let base = serve(Router::new().route(
        "/openai/deployments/{deployment}/chat/completions",
        post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            if headers.get("api-key").and_then(|v| v.to_str().ok()) != Some("test-key") {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            if body["stream"] != true {
                return (StatusCode::BAD_REQUEST, "expected a streaming request").into_response();
            }
            ([(header::CONTENT_TYPE, "text/event-stream")], CHAT_EVENTS).into_response()
        }),
    ))
    .await;

    let deltas: Vec<String> = chat(&base, TIMEOUT)
        .complete_stream(&question())
        .await
        .unwrap()
        .map(|delta| delta.unwrap())
        .collect()
        .await;
    assert_eq!(deltas, vec!["Run ", "setup.exe"]);
}

#[tokio::test]
async fn malformed_stream_chunk_ends_the_answer() {
    let base = serve(Router::new().fallback(|| async {
        ([(header::CONTENT_TYPE, "text/event-stream")], "data: {\"choices\":[{\"delta\":{\"content\":\"Run\"}}]}\n\ndata: oops\n\n")
    }))
    .await;

    let mut deltas = chat(&base, TIMEOUT).complete_stream(&question()).await.unwrap();
    assert_eq!(deltas.next().await.unwrap().unwrap(), "Run");
    let err = deltas.next().await.unwrap().unwrap_err();
    assert!(matches!(err, RagError::Completion { kind: ServiceErrorKind::Malformed, .. }));
}

#[tokio::test]
async fn created_collection_uses_binary_quantization() {
    let created: Arc<Mutex<Option<Value>>> = Arc::default();
    let captured = created.clone();
    let base = serve(Router::new().route(
        "/collections/{name}",
        get(|| async { (StatusCode::NOT_FOUND, Json(json!({"status": {"error": "Not found"}}))) }).put(
            move |Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = Some(body);
                    Json(json!({"result": true, "status": "ok", "time": 0.001}))
                }
            },
        ),
    ))
    .await;

    let store = QdrantVectorStore::new(&base, None, TIMEOUT).unwrap();
    store.create_collection("manual", 1536).await.unwrap();

    let body = created.lock().unwrap().clone().expect("collection was created");
    assert_eq!(body["vectors"], json!({"size": 1536, "distance": "Cosine"}));
    assert_eq!(body["quantization_config"], json!({"binary": {"always_ram": false}}));
}
