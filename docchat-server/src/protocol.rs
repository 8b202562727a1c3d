use chrono::{DateTime, Utc};
use docchat_rag::{Answer, SearchResult};
use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type TurnId = String;

/// Characters of chunk text kept in a source excerpt.
pub const EXCERPT_CHARS: usize = 280;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
}

/// A retrieved chunk as shown next to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// 1-based, matching the `[n]` markers in the prompt context.
    pub index: usize,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    pub score: f32,
    pub excerpt: String,
}

impl Source {
    pub fn from_result(index: usize, result: &SearchResult) -> Self {
        let chunk = &result.chunk;
        Self {
            index,
            source: chunk.source().unwrap_or(&chunk.document_id).to_string(),
            page: chunk.page().map(str::to_string),
            score: result.score,
            excerpt: excerpt(&chunk.text),
        }
    }

    pub fn from_context(context: &[SearchResult]) -> Vec<Self> {
        context.iter().enumerate().map(|(i, r)| Self::from_result(i + 1, r)).collect()
    }

    pub fn from_answer(answer: &Answer) -> Vec<Self> {
        Self::from_context(&answer.context)
    }
}

fn excerpt(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}…", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub turn_id: TurnId,
    pub answer: String,
    pub sources: Vec<Source>,
}

/// Names of the server-sent events of a streamed chat turn, in order:
/// one `sources`, any number of `token`, then `done` or `error`.
pub mod stream_event {
    pub const SOURCES: &str = "sources";
    pub const TOKEN: &str = "token";
    pub const DONE: &str = "done";
    pub const ERROR: &str = "error";
}

/// First event of a streamed turn, sent before any answer text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStarted {
    pub turn_id: TurnId,
    pub sources: Vec<Source>,
}

/// A piece of answer text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDelta {
    pub text: String,
}

/// One question and its answer within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: TurnId,
    pub question: String,
    pub answer: String,
    pub sources: Vec<Source>,
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub session_id: SessionId,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearHistoryResponse {
    pub session_id: SessionId,
    pub cleared: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
}
