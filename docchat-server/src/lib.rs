//! `docchat-server` serves the chat UI and its JSON API.
//!
//! Answers come from a [`ChainCache`]; chat histories live in memory per
//! session and each turn's spans can be fetched from `/api/trace/{turn_id}`.

pub mod cache;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use cache::{ChainCache, ChainFactory, ReloadStatus, SettingsChainFactory};
pub use error::ApiError;
pub use server::{AppState, ServerConfig, app_router, run_server};
pub use session::SessionStore;
