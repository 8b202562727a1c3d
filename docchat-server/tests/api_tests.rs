mod common;

use std::sync::Arc;

use common::{ANSWER, CannedModel, TestFactory, indexed_store, spawn_server, state_for};
use docchat_rag::{InMemoryVectorStore, ServiceErrorKind};
use docchat_server::protocol::{ChatResponse, ErrorResponse, HistoryResponse};
use docchat_telemetry::{TurnTraceLayer, TurnTraceStore};
use serde_json::{Value, json};
use tracing_subscriber::layer::SubscriberExt;

async fn new_session(client: &reqwest::Client, base: &str) -> String {
    let created: Value = client
        .post(format!("{base}/api/session"))
        .send()
        .await
        .expect("session create response")
        .json()
        .await
        .expect("session json");
    created.get("session_id").and_then(Value::as_str).expect("session_id field").to_string()
}

async fn ask_streaming(client: &reqwest::Client, base: &str, session_id: &str, question: &str) -> reqwest::Response {
    client
        .post(format!("{base}/api/chat/{session_id}/stream"))
        .json(&json!({ "question": question }))
        .send()
        .await
        .expect("stream response")
}

/// Named events of a server-sent event body, with their JSON data.
fn sse_events(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut name = None;
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    name = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push_str(value.strip_prefix(' ').unwrap_or(value));
                }
            }
            Some((name?, serde_json::from_str(&data).ok()?))
        })
        .collect()
}

async fn ask(client: &reqwest::Client, base: &str, session_id: &str, question: &str) -> reqwest::Response {
    client
        .post(format!("{base}/api/chat/{session_id}"))
        .json(&json!({ "question": question }))
        .send()
        .await
        .expect("chat response")
}

#[tokio::test]
async fn health_and_index_are_served() {
    let factory = Arc::new(TestFactory::new(indexed_store().await, Arc::new(CannedModel::healthy())));
    let (base, handle) = spawn_server(state_for(factory.clone())).await;
    let client = reqwest::Client::new();

    let health: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");

    let index = client.get(format!("{base}/")).send().await.unwrap();
    assert!(index.status().is_success());
    assert!(index.text().await.unwrap().contains("docchat"));

    // Nothing asked yet, so no chain was built.
    assert_eq!(factory.builds(), 0);
    handle.abort();
}

#[tokio::test]
async fn chat_answers_and_records_history() {
    let factory = Arc::new(TestFactory::new(indexed_store().await, Arc::new(CannedModel::healthy())));
    let (base, handle) = spawn_server(state_for(factory.clone())).await;
    let client = reqwest::Client::new();
    let session_id = new_session(&client, &base).await;

    let response = ask(&client, &base, &session_id, "  How do I install it?  ").await;
    assert!(response.status().is_success());
    let body: ChatResponse = response.json().await.unwrap();
    assert_eq!(body.answer, ANSWER);
    assert_eq!(body.sources[0].index, 1);
    assert_eq!(body.sources[0].source, "manual.pdf");
    assert_eq!(body.sources[0].page.as_deref(), Some("2"));

    ask(&client, &base, &session_id, "And the license?").await;
    assert_eq!(factory.builds(), 1);

    let history: HistoryResponse =
        client.get(format!("{base}/api/history/{session_id}")).send().await.unwrap().json().await.unwrap();
    assert_eq!(history.turns.len(), 2);
    assert_eq!(history.turns[0].question, "How do I install it?");
    assert_eq!(history.turns[0].turn_id, body.turn_id);

    let cleared: Value =
        client.delete(format!("{base}/api/history/{session_id}")).send().await.unwrap().json().await.unwrap();
    assert_eq!(cleared["cleared"], 2);
    let history: HistoryResponse =
        client.get(format!("{base}/api/history/{session_id}")).send().await.unwrap().json().await.unwrap();
    assert!(history.turns.is_empty());

    handle.abort();
}

#[tokio::test]
async fn blank_question_is_a_bad_request() {
    let factory = Arc::new(TestFactory::new(indexed_store().await, Arc::new(CannedModel::healthy())));
    let (base, handle) = spawn_server(state_for(factory.clone())).await;
    let client = reqwest::Client::new();
    let session_id = new_session(&client, &base).await;

    let response = ask(&client, &base, &session_id, "   ").await;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "invalid_input");
    assert_eq!(body.error, "Please enter a question.");
    assert_eq!(factory.builds(), 0);

    handle.abort();
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let factory = Arc::new(TestFactory::new(indexed_store().await, Arc::new(CannedModel::healthy())));
    let (base, handle) = spawn_server(state_for(factory)).await;
    let client = reqwest::Client::new();

    let response = ask(&client, &base, "missing", "How do I install it?").await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let response = client.get(format!("{base}/api/history/missing")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    handle.abort();
}

#[tokio::test]
async fn upstream_failures_map_to_friendly_errors() {
    let cases = [
        (ServiceErrorKind::Timeout, reqwest::StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable"),
        (ServiceErrorKind::Auth, reqwest::StatusCode::BAD_GATEWAY, "upstream_failed"),
    ];
    for (kind, status, code) in cases {
        let model = Arc::new(CannedModel::new(usize::MAX, kind));
        let factory = Arc::new(TestFactory::new(indexed_store().await, model));
        let (base, handle) = spawn_server(state_for(factory)).await;
        let client = reqwest::Client::new();
        let session_id = new_session(&client, &base).await;

        let response = ask(&client, &base, &session_id, "How do I install it?").await;
        assert_eq!(response.status(), status);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.code, code);
        assert!(!body.error.contains("sk-live"), "leaked upstream detail: {}", body.error);

        let history: HistoryResponse =
            client.get(format!("{base}/api/history/{session_id}")).send().await.unwrap().json().await.unwrap();
        assert!(history.turns.is_empty());
        handle.abort();
    }
}

#[tokio::test]
async fn missing_collection_is_an_internal_error() {
    let factory = Arc::new(TestFactory::new(
        Arc::new(InMemoryVectorStore::new()),
        Arc::new(CannedModel::healthy()),
    ));
    let (base, handle) = spawn_server(state_for(factory)).await;
    let client = reqwest::Client::new();
    let session_id = new_session(&client, &base).await;

    let response = ask(&client, &base, &session_id, "How do I install it?").await;
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    handle.abort();
}

#[tokio::test]
async fn reload_rebuilds_only_after_a_change() {
    let factory = Arc::new(TestFactory::new(indexed_store().await, Arc::new(CannedModel::healthy())));
    let (base, handle) = spawn_server(state_for(factory.clone())).await;
    let client = reqwest::Client::new();
    let session_id = new_session(&client, &base).await;
    ask(&client, &base, &session_id, "How do I install it?").await;

    let status: Value = client.post(format!("{base}/api/reload")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["rebuilt"], false);
    assert_eq!(factory.builds(), 1);

    factory.set_system_prompt("Answer briefly.");
    let status: Value = client.post(format!("{base}/api/reload")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["rebuilt"], true);
    assert_eq!(factory.builds(), 2);

    handle.abort();
}

#[tokio::test]
async fn turn_trace_is_served() {
    let traces = Arc::new(TurnTraceStore::new());
    let subscriber = tracing_subscriber::registry().with(TurnTraceLayer::new(traces.clone()));
    // Current-thread runtime: the spawned server shares this thread's subscriber.
    let _guard = tracing::subscriber::set_default(subscriber);

    let factory = Arc::new(TestFactory::new(indexed_store().await, Arc::new(CannedModel::healthy())));
    let (base, handle) = spawn_server(state_for(factory).with_traces(traces.clone())).await;
    let client = reqwest::Client::new();
    let session_id = new_session(&client, &base).await;

    let body: ChatResponse = ask(&client, &base, &session_id, "How do I install it?").await.json().await.unwrap();
    let trace: Value =
        client.get(format!("{base}/api/trace/{}", body.turn_id)).send().await.unwrap().json().await.unwrap();
    assert_eq!(trace["session_id"], session_id.as_str());
    let names: Vec<&str> = trace["spans"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    for expected in ["chat.turn", "rag.embed", "rag.retrieve", "rag.prompt", "rag.complete"] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }

    let missing = client.get(format!("{base}/api/trace/unknown")).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    client.delete(format!("{base}/api/history/{session_id}")).send().await.unwrap();
    assert!(traces.get(&body.turn_id).is_none());
    handle.abort();
}

#[tokio::test]
async fn streamed_chat_sends_sources_tokens_then_done() {
    let factory = Arc::new(TestFactory::new(indexed_store().await, Arc::new(CannedModel::healthy())));
    let (base, handle) = spawn_server(state_for(factory)).await;
    let client = reqwest::Client::new();
    let session_id = new_session(&client, &base).await;

    let response = ask_streaming(&client, &base, &session_id, "How do I install it?").await;
    assert!(response.status().is_success());
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");
    let events = sse_events(&response.text().await.unwrap());

    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names.first(), Some(&"sources"));
    assert_eq!(names.last(), Some(&"done"));
    assert!(names[1..names.len() - 1].iter().all(|name| *name == "token"));
    assert!(names.len() > 3, "expected several token events: {names:?}");

    let (_, started) = &events[0];
    assert_eq!(started["sources"][0]["page"], "2");
    let streamed: String = events
        .iter()
        .filter(|(name, _)| name == "token")
        .filter_map(|(_, data)| data["text"].as_str())
        .collect();
    assert_eq!(streamed, ANSWER);

    let (_, done) = events.last().unwrap();
    assert_eq!(done["answer"], ANSWER);
    assert_eq!(done["turn_id"], started["turn_id"]);

    let history: HistoryResponse =
        client.get(format!("{base}/api/history/{session_id}")).send().await.unwrap().json().await.unwrap();
    assert_eq!(history.turns.len(), 1);
    assert_eq!(history.turns[0].answer, ANSWER);
    assert_eq!(done["turn_id"], history.turns[0].turn_id.as_str());

    handle.abort();
}

#[tokio::test]
async fn streamed_chat_reports_upstream_failure_as_an_event() {
    let model = Arc::new(CannedModel::new(usize::MAX, ServiceErrorKind::Timeout));
    let factory = Arc::new(TestFactory::new(indexed_store().await, model));
    let (base, handle) = spawn_server(state_for(factory)).await;
    let client = reqwest::Client::new();
    let session_id = new_session(&client, &base).await;

    let response = ask_streaming(&client, &base, &session_id, "How do I install it?").await;
    assert!(response.status().is_success());
    let events = sse_events(&response.text().await.unwrap());
    assert_eq!(events.len(), 1);
    let (name, error) = &events[0];
    assert_eq!(name, "error");
    assert_eq!(error["code"], "upstream_unavailable");
    assert!(!error["error"].as_str().unwrap().contains("sk-live"));

    let history: HistoryResponse =
        client.get(format!("{base}/api/history/{session_id}")).send().await.unwrap().json().await.unwrap();
    assert!(history.turns.is_empty());
    handle.abort();
}

#[tokio::test]
async fn streamed_chat_checks_input_before_streaming() {
    let factory = Arc::new(TestFactory::new(indexed_store().await, Arc::new(CannedModel::healthy())));
    let (base, handle) = spawn_server(state_for(factory.clone())).await;
    let client = reqwest::Client::new();
    let session_id = new_session(&client, &base).await;

    let response = ask_streaming(&client, &base, &session_id, "  ").await;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "invalid_input");

    let response = ask_streaming(&client, &base, "missing", "How do I install it?").await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(factory.builds(), 0);
    handle.abort();
}
