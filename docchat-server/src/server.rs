use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    response::{
        Html, IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use docchat_rag::validate_question;
use docchat_telemetry::{TurnTrace, TurnTraceStore};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::{
    cache::{ChainCache, ReloadStatus},
    error::ApiError,
    protocol::{
        ChatRequest, ChatResponse, ClearHistoryResponse, ErrorResponse, HistoryResponse,
        SessionCreateResponse, SessionId, Source, StreamStarted, TokenDelta, Turn, TurnId,
        stream_event,
    },
    session::SessionStore,
};

/// Events buffered for a slow client before the answer stream waits.
const STREAM_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub chains: Arc<ChainCache>,
    /// Present when a `TurnTraceLayer` feeds this store.
    pub traces: Option<Arc<TurnTraceStore>>,
}

impl AppState {
    pub fn new(chains: Arc<ChainCache>) -> Self {
        Self { sessions: SessionStore::default(), chains, traces: None }
    }

    pub fn with_traces(mut self, traces: Arc<TurnTraceStore>) -> Self {
        self.traces = Some(traces);
        self
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8501 }
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/session", post(create_session))
        .route("/api/chat/{session_id}", post(chat))
        .route("/api/chat/{session_id}/stream", post(chat_stream))
        .route("/api/history/{session_id}", get(history).delete(clear_history))
        .route("/api/trace/{turn_id}", get(trace))
        .route("/api/reload", post(reload))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serves until Ctrl-C.
pub async fn run_server(config: ServerConfig, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid host/port {}:{}", config.host, config.port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("docchat listening on http://{}", addr);
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    info!("docchat server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn index() -> impl IntoResponse {
    Html(include_str!("../ui/index.html"))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status":"ok","service":"docchat"}))
}

async fn create_session(State(state): State<AppState>) -> impl IntoResponse {
    let session_id = state.sessions.create_session().await;
    Json(SessionCreateResponse { session_id })
}

async fn chat(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if !state.sessions.has_session(&session_id).await {
        return Err(ApiError::SessionNotFound(session_id));
    }
    let question = validate_question(&request.question)?;

    let turn_id = Uuid::new_v4().to_string();
    let span = info_span!("chat.turn", turn.id = %turn_id, session.id = %session_id);
    let answer = async {
        let chain = state.chains.get().await?;
        chain.answer(question).await
    }
    .instrument(span.clone())
    .await
    .inspect_err(|err| span.in_scope(|| error!(error = %err, "chat turn failed")))?;

    let sources = Source::from_answer(&answer);
    let turn = Turn {
        turn_id: turn_id.clone(),
        question: question.to_string(),
        answer: answer.text.clone(),
        sources: sources.clone(),
        asked_at: Utc::now(),
    };
    state
        .sessions
        .append_turn(&session_id, turn)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;

    Ok(Json(ChatResponse { turn_id, answer: answer.text, sources }))
}

/// Answers like [`chat`], sending the answer as server-sent events while it is
/// generated. Session and question are checked before the stream opens; later
/// failures arrive as an `error` event.
async fn chat_stream(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if !state.sessions.has_session(&session_id).await {
        return Err(ApiError::SessionNotFound(session_id));
    }
    let question = validate_question(&request.question)?.to_string();

    let turn_id = Uuid::new_v4().to_string();
    let span = info_span!("chat.turn", turn.id = %turn_id, session.id = %session_id, streaming = true);
    let (events, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(stream_turn(state, session_id, turn_id, question, events).instrument(span));

    Ok(Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>)).keep_alive(KeepAlive::default()))
}

async fn stream_turn(
    state: AppState,
    session_id: SessionId,
    turn_id: TurnId,
    question: String,
    events: mpsc::Sender<Event>,
) {
    let response = match stream_answer(&state, &turn_id, &question, &events).await {
        Ok(Some(response)) => response,
        Ok(None) => {
            debug!("client went away before the answer finished");
            return;
        }
        Err(err) => {
            error!(error = %err, "chat turn failed");
            let _ = events.send(error_event(&ApiError::from(err))).await;
            return;
        }
    };

    let turn = Turn {
        turn_id,
        question,
        answer: response.answer.clone(),
        sources: response.sources.clone(),
        asked_at: Utc::now(),
    };
    let event = match state.sessions.append_turn(&session_id, turn).await {
        Some(()) => sse_event(stream_event::DONE, &response),
        None => error_event(&ApiError::SessionNotFound(session_id)),
    };
    let _ = events.send(event).await;
}

/// Sends `sources` and then one `token` per delta. `None` when the client
/// stopped listening.
async fn stream_answer(
    state: &AppState,
    turn_id: &str,
    question: &str,
    events: &mpsc::Sender<Event>,
) -> docchat_rag::Result<Option<ChatResponse>> {
    let chain = state.chains.get().await?;
    let mut answer = chain.answer_stream(question).await?;

    let sources = Source::from_context(&answer.context);
    let started = StreamStarted { turn_id: turn_id.to_string(), sources: sources.clone() };
    if events.send(sse_event(stream_event::SOURCES, &started)).await.is_err() {
        return Ok(None);
    }

    let mut text = String::new();
    while let Some(delta) = answer.tokens.next().await {
        let delta = delta?;
        text.push_str(&delta);
        if events.send(sse_event(stream_event::TOKEN, &TokenDelta { text: delta })).await.is_err() {
            return Ok(None);
        }
    }
    info!(answer_len = text.len(), "streamed answer");
    Ok(Some(ChatResponse { turn_id: turn_id.to_string(), answer: text, sources }))
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    Event::default().event(name).json_data(payload).unwrap_or_else(|err| {
        Event::default()
            .event(stream_event::ERROR)
            .data(json!({"code": "internal", "error": err.to_string()}).to_string())
    })
}

fn error_event(err: &ApiError) -> Event {
    sse_event(stream_event::ERROR, &ErrorResponse { code: err.code().to_string(), error: err.message() })
}

async fn history(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let turns = state
        .sessions
        .history(&session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;
    Ok(Json(HistoryResponse { session_id, turns }))
}

async fn clear_history(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ClearHistoryResponse>, ApiError> {
    let cleared = state
        .sessions
        .clear(&session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;
    if let Some(traces) = &state.traces {
        traces.forget_session(&session_id);
    }
    Ok(Json(ClearHistoryResponse { session_id, cleared }))
}

async fn trace(
    Path(turn_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TurnTrace>, ApiError> {
    state
        .traces
        .as_ref()
        .and_then(|traces| traces.get(&turn_id))
        .map(Json)
        .ok_or(ApiError::TraceNotFound(turn_id))
}

async fn reload(State(state): State<AppState>) -> Result<Json<ReloadStatus>, ApiError> {
    Ok(Json(state.chains.reload().await?))
}
