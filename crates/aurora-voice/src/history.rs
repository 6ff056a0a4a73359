//! Conversation history and the per-session store.
//!
//! Each session owns one `ConversationHistory` behind a `tokio::sync::Mutex`; the store
//! maps session ids to sessions and is the only place sessions are created or evicted.

use crate::tags::Urgency;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// System preamble plus a sliding window over the most recent `cap` turns.
///
/// `len()` counts the preamble, so it never exceeds `cap + 1`.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    preamble: ConversationTurn,
    turns: VecDeque<ConversationTurn>,
    cap: usize,
}

impl ConversationHistory {
    pub fn new(preamble: impl Into<String>, cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            preamble: ConversationTurn::system(preamble),
            turns: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        if turn.role == Role::System {
            warn!("system turn pushed into history; storing as-is");
        }
        self.turns.push_back(turn);
        while self.turns.len() > self.cap {
            self.turns.pop_front();
        }
    }

    pub fn preamble(&self) -> &ConversationTurn {
        &self.preamble
    }

    /// Retained turns, oldest first, without the preamble
    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// Preamble followed by the retained turns
    pub fn messages(&self) -> Vec<ConversationTurn> {
        std::iter::once(self.preamble.clone())
            .chain(self.turns.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// A critical or urgent response, kept for the end-of-session summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalAlert {
    pub timestamp: DateTime<Utc>,
    pub urgency: Urgency,
    pub input: String,
    pub response: String,
    pub sources: Vec<String>,
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub history: ConversationHistory,
    pub started_at: DateTime<Utc>,
    started: Instant,
    /// Worker turns answered so far
    pub exchanges: usize,
    pub critical_alerts: Vec<CriticalAlert>,
    /// Every turn of the session, not just the model's window
    transcript: Vec<ConversationTurn>,
}

impl Session {
    fn new(id: String, preamble: &str, history_cap: usize) -> Self {
        Self {
            id,
            history: ConversationHistory::new(preamble, history_cap),
            started_at: Utc::now(),
            started: Instant::now(),
            exchanges: 0,
            critical_alerts: Vec::new(),
            transcript: Vec::new(),
        }
    }

    /// Record one answered exchange.
    pub fn record_exchange(&mut self, input: &str, response: &str) {
        let user = ConversationTurn::user(input);
        let assistant = ConversationTurn::assistant(response);
        self.transcript.push(user.clone());
        self.transcript.push(assistant.clone());
        self.history.push(user);
        self.history.push(assistant);
        self.exchanges += 1;
    }

    pub fn record_alert(&mut self, alert: CriticalAlert) {
        warn!(
            session = %self.id,
            urgency = %alert.urgency,
            input = %alert.input,
            "🚨 Critical alert"
        );
        self.critical_alerts.push(alert);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn summarize(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            started_at: self.started_at,
            duration: self.elapsed(),
            exchanges: self.exchanges,
            critical_alerts: self.critical_alerts.clone(),
            turns: self.transcript.clone(),
        }
    }
}

/// Produced when a session is evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub exchanges: usize,
    pub critical_alerts: Vec<CriticalAlert>,
    pub turns: Vec<ConversationTurn>,
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Session id → session. Sessions are created by `open` and removed by `end`.
pub struct SessionStore {
    sessions: DashMap<String, SessionHandle>,
    preamble: String,
    history_cap: usize,
}

impl SessionStore {
    pub fn new(preamble: impl Into<String>, history_cap: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            preamble: preamble.into(),
            history_cap,
        }
    }

    /// Return the session for `id`, creating it if it does not exist.
    pub fn open(&self, id: &str) -> SessionHandle {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                info!(session = id, "📂 Session opened");
                Arc::new(Mutex::new(Session::new(
                    id.to_string(),
                    &self.preamble,
                    self.history_cap,
                )))
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Evict the session and summarize it. Waits for any in-progress exchange to release it.
    pub async fn end(&self, id: &str) -> Option<SessionSummary> {
        let (_, handle) = self.sessions.remove(id)?;
        let session = handle.lock().await;
        let summary = session.summarize();
        info!(
            session = id,
            exchanges = summary.exchanges,
            critical_alerts = summary.critical_alerts.len(),
            duration_secs = summary.duration.as_secs(),
            "📁 Session ended"
        );
        Some(summary)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }
}
