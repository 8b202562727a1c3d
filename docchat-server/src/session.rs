use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{SessionId, Turn};

/// Turns kept per session; older ones are dropped first.
const MAX_STORED_TURNS: usize = 200;

/// Sessions kept by default; the least recently used one is dropped first.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

#[derive(Debug)]
struct Session {
    turns: Vec<Turn>,
    last_used: Instant,
}

/// Chat histories keyed by session id.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    /// A store holding at most `max_sessions` sessions.
    pub fn with_capacity(max_sessions: usize) -> Self {
        Self { sessions: Arc::default(), max_sessions: max_sessions.max(1) }
    }

    pub async fn create_session(&self) -> SessionId {
        let session_id = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().await;
        while sessions.len() >= self.max_sessions {
            let Some(oldest) =
                sessions.iter().min_by_key(|(_, session)| session.last_used).map(|(id, _)| id.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
            debug!(session.id = %oldest, "evicted least recently used session");
        }
        sessions.insert(session_id.clone(), Session { turns: Vec::new(), last_used: Instant::now() });
        session_id
    }

    /// Whether the session exists. Counts as a use.
    pub async fn has_session(&self, session_id: &str) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn append_turn(&self, session_id: &str, turn: Turn) -> Option<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.last_used = Instant::now();
        let turns = &mut session.turns;
        turns.push(turn);
        if turns.len() > MAX_STORED_TURNS {
            let drain_to = turns.len() - MAX_STORED_TURNS;
            turns.drain(0..drain_to);
        }
        Some(())
    }

    pub async fn history(&self, session_id: &str) -> Option<Vec<Turn>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.last_used = Instant::now();
        Some(session.turns.clone())
    }

    /// Empties a session's history, returning how many turns were removed.
    pub async fn clear(&self, session_id: &str) -> Option<usize> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.last_used = Instant::now();
        let cleared = session.turns.len();
        session.turns.clear();
        Some(cleared)
    }
}
