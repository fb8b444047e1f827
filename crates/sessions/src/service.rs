use async_trait::async_trait;
use runner_domain::error::Result;
use runner_domain::event::{Event, StateDelta};
use runner_domain::invocation::ConversationKey;

use crate::session::Session;

/// The durable-conversation backend consumed by the runner. Implementations
/// may be synchronous or asynchronous internally; the runner only ever
/// awaits their results from the Event Loop task.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(&self, key: &ConversationKey) -> Result<Session>;
    async fn get_session(&self, key: &ConversationKey) -> Result<Option<Session>>;
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>>;
    async fn delete_session(&self, key: &ConversationKey) -> Result<()>;

    async fn append_event(&self, key: &ConversationKey, event: Event) -> Result<()>;

    async fn update_session_state(&self, key: &ConversationKey, delta: StateDelta) -> Result<()>;
    async fn update_app_state(&self, app_name: &str, delta: StateDelta) -> Result<()>;
    async fn update_user_state(&self, app_name: &str, user_id: &str, delta: StateDelta) -> Result<()>;

    async fn create_session_summary(&self, key: &ConversationKey, filter_key: &str, text: String) -> Result<()>;
    async fn enqueue_summary_job(&self, key: &ConversationKey, filter_key: &str, force: bool) -> Result<()>;
    async fn get_session_summary_text(&self, key: &ConversationKey, filter_key: &str) -> Result<Option<String>>;

    /// Idempotent shutdown. The runner only invokes this when it holds the
    /// ownership bit for the service (it did not receive it pre-built).
    async fn close(&self) -> Result<()>;
}

/// Optional auxiliary collaborator that extracts durable facts from a
/// completed run. Errors are advisory — logged at debug, never surfaced.
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn enqueue_auto_memory_job(&self, session: &Session) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
