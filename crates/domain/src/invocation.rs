use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::agent::Agent;
use crate::content::Role;
use crate::event::Event;
use crate::plugin::Plugin;

/// Uniquely identifies a durable transcript: `(appName, userID,
/// conversationID)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub app_name: String,
    pub user_id: String,
    pub conversation_id: String,
}

impl ConversationKey {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }

    /// Stable string form, used as the run registry's/session store's
    /// lookup key and in trace events.
    pub fn as_key(&self) -> String {
        format!("{}:{}:{}", self.app_name, self.user_id, self.conversation_id)
    }
}

/// A single message supplied as conversation-history seed (`Run`'s
/// `messages_seed` option).
#[derive(Debug, Clone)]
pub struct SeedMessage {
    pub role: Role,
    pub text: String,
}

impl SeedMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self { role, text: text.into() }
    }
}

/// Decides whether a processed event should be forwarded to the caller's
/// stream. Must be monotonic: the same event evaluated twice yields the
/// same decision (§8).
pub trait StreamModeFilter: Send + Sync {
    fn should_emit(&self, event: &Event) -> bool;
}

/// The default filter: emit everything.
pub struct EmitAll;

impl StreamModeFilter for EmitAll {
    fn should_emit(&self, _event: &Event) -> bool {
        true
    }
}

/// Options accepted by `Runner::run`.
pub struct RunOptions {
    pub request_id: Option<String>,
    pub agent_override: Option<Arc<dyn Agent>>,
    pub agent_by_name: Option<String>,
    pub messages_seed: Option<Vec<SeedMessage>>,
    pub max_run_duration: Option<std::time::Duration>,
    pub detached_cancel: bool,
    pub stream_mode_filter: Arc<dyn StreamModeFilter>,
    pub graph_emit_final_model_responses: bool,
    pub plugins: Vec<Arc<dyn Plugin>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            request_id: None,
            agent_override: None,
            agent_by_name: None,
            messages_seed: None,
            max_run_duration: None,
            detached_cancel: false,
            stream_mode_filter: Arc::new(EmitAll),
            graph_emit_final_model_responses: true,
            plugins: Vec::new(),
        }
    }
}

/// Computes the completion-notice registry key for a given event id, i.e.
/// the source's `appendEventNotice(event.id)`.
pub fn append_event_notice_key(event_id: &str) -> String {
    format!("append-event:{event_id}")
}

/// A `requestID → one-shot signal` rendezvous registry. `register`
/// returns a receiver the caller awaits; `notify` closes the
/// corresponding sender exactly once (subsequent calls are no-ops).
#[derive(Default)]
pub struct CompletionNotices {
    inner: Mutex<HashMap<String, Option<oneshot::Sender<()>>>>,
}

impl CompletionNotices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(key.into(), Some(tx));
        rx
    }

    pub fn notify(&self, key: &str) {
        if let Some(slot) = self.inner.lock().get_mut(key) {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// The per-run object exclusively owned by the Event Loop.
pub struct Invocation {
    pub invocation_id: String,
    pub request_id: String,
    pub agent: Arc<dyn Agent>,
    pub conversation_key: ConversationKey,
    pub message: Option<SeedMessage>,
    pub options: Arc<RunOptions>,
    pub completion_notices: CompletionNotices,
}

impl Invocation {
    pub fn new(
        invocation_id: impl Into<String>,
        request_id: impl Into<String>,
        agent: Arc<dyn Agent>,
        conversation_key: ConversationKey,
        message: Option<SeedMessage>,
        options: Arc<RunOptions>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            request_id: request_id.into(),
            agent,
            conversation_key,
            message,
            options,
            completion_notices: CompletionNotices::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_as_key_format() {
        let key = ConversationKey::new("app", "u1", "c1");
        assert_eq!(key.as_key(), "app:u1:c1");
    }

    #[tokio::test]
    async fn completion_notices_register_and_notify() {
        let notices = CompletionNotices::new();
        let rx = notices.register("e1");
        notices.notify("e1");
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn completion_notices_notify_is_idempotent() {
        let notices = CompletionNotices::new();
        let rx = notices.register("e1");
        notices.notify("e1");
        notices.notify("e1"); // second call must not panic
        assert!(rx.await.is_ok());
    }

    #[test]
    fn completion_notices_notify_unknown_key_is_noop() {
        let notices = CompletionNotices::new();
        notices.notify("missing"); // must not panic
    }

    #[test]
    fn append_event_notice_key_format() {
        assert_eq!(append_event_notice_key("e1"), "append-event:e1");
    }
}
