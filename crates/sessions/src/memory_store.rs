//! Reference in-memory `SessionService`/`MemoryService`.
//!
//! Exists to make `runner-core` buildable and testable in isolation; real
//! deployments back `SessionService` with a durable store instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use runner_domain::error::Result;
use runner_domain::event::{Event, StateDelta};
use runner_domain::invocation::ConversationKey;

use crate::service::{MemoryService, SessionService};
use crate::session::{Session, Summary};

/// An in-memory `SessionService`. Sessions live for the lifetime of the
/// process; concurrent access is serialized by a single `RwLock`, matching
/// the "Session Service is the only shared mutator" contract.
#[derive(Default)]
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<String, Session>>,
    app_state: RwLock<HashMap<String, StateDelta>>,
    user_state: RwLock<HashMap<String, StateDelta>>,
    closed: AtomicBool,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_state_key(app_name: &str, user_id: &str) -> String {
        format!("{app_name}:{user_id}")
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(&self, key: &ConversationKey) -> Result<Session> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(key.as_key())
            .or_insert_with(|| Session::new(key.clone()));
        Ok(entry.clone())
    }

    async fn get_session(&self, key: &ConversationKey) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(&key.as_key()).cloned())
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.key.app_name == app_name && s.key.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_session(&self, key: &ConversationKey) -> Result<()> {
        self.sessions.write().remove(&key.as_key());
        Ok(())
    }

    async fn append_event(&self, key: &ConversationKey, event: Event) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(key.as_key())
            .or_insert_with(|| Session::new(key.clone()));
        if let Some(delta) = &event.state_delta {
            session
                .conversation_state
                .extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        session.events.push(event);
        session.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn update_session_state(&self, key: &ConversationKey, delta: StateDelta) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(key.as_key())
            .or_insert_with(|| Session::new(key.clone()));
        session.conversation_state.extend(delta);
        session.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn update_app_state(&self, app_name: &str, delta: StateDelta) -> Result<()> {
        self.app_state
            .write()
            .entry(app_name.to_string())
            .or_default()
            .extend(delta);
        Ok(())
    }

    async fn update_user_state(&self, app_name: &str, user_id: &str, delta: StateDelta) -> Result<()> {
        self.user_state
            .write()
            .entry(Self::user_state_key(app_name, user_id))
            .or_default()
            .extend(delta);
        Ok(())
    }

    async fn create_session_summary(&self, key: &ConversationKey, filter_key: &str, text: String) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(key.as_key())
            .or_insert_with(|| Session::new(key.clone()));
        session.summaries.insert(
            filter_key.to_string(),
            Summary {
                text,
                updated_at: chrono::Utc::now(),
            },
        );
        Ok(())
    }

    async fn enqueue_summary_job(&self, key: &ConversationKey, filter_key: &str, force: bool) -> Result<()> {
        tracing::debug!(session = %key.as_key(), filter_key, force, "summary job enqueued (in-memory no-op)");
        Ok(())
    }

    async fn get_session_summary_text(&self, key: &ConversationKey, filter_key: &str) -> Result<Option<String>> {
        Ok(self
            .sessions
            .read()
            .get(&key.as_key())
            .and_then(|s| s.summaries.get(filter_key))
            .map(|s| s.text.clone()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// An in-memory `MemoryService` that records invocations for test assertions.
#[derive(Default)]
pub struct InMemoryMemoryService {
    enqueued: RwLock<Vec<String>>,
}

impl InMemoryMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueued_sessions(&self) -> Vec<String> {
        self.enqueued.read().clone()
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn enqueue_auto_memory_job(&self, session: &Session) -> Result<()> {
        self.enqueued.write().push(session.key.as_key());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
