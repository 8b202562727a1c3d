//! Chat completion model trait.

use std::fmt;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
        }
    }
}

/// One message of a chat prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// Answer text as it is generated, one delta per item.
///
/// An `Err` item ends the answer; nothing follows it.
pub type CompletionStream = BoxStream<'static, Result<String>>;

/// A chat completion service.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Complete the conversation and return the assistant's text.
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Complete the conversation, yielding text as it is generated.
    ///
    /// Errors returned here happen before any text was produced and may be
    /// retried. The default yields the whole of [`CompletionModel::complete`]
    /// as a single delta.
    async fn complete_stream(&self, messages: &[Message]) -> Result<CompletionStream> {
        let text = self.complete(messages).await?;
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }

    /// Model or deployment name used in logs and errors.
    fn name(&self) -> &str;
}
