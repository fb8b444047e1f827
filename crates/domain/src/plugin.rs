use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;
use crate::invocation::Invocation;

/// A pass-through hook the Event Loop feeds every event through before
/// applying persistence gating. A plugin that wants to leave the event
/// untouched returns `Ok(None)`; a replacement fills identity fields
/// (`request_id`, `invocation_id`, `parent_invocation_id`, `branch`,
/// `filter_key`) from the original wherever it left them empty — the
/// Event Loop does this merge, not the plugin.
///
/// Plugins must be reentrant-safe and must not block indefinitely; a
/// returned error is logged and the Event Loop falls back to the
/// original event.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn on_event(&self, invocation: &Invocation, event: &Event) -> Result<Option<Event>>;
}
