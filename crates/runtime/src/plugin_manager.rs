//! `PluginManager` — runs every configured plugin's `on_event` hook over
//! each event flowing through the Event Loop, merging identity fields into
//! a replacement event on a "fill-if-empty" basis.

use std::sync::Arc;

use runner_domain::event::Event;
use runner_domain::invocation::Invocation;
use runner_domain::plugin::Plugin;

pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Feed `event` through every plugin in order. A plugin returning
    /// `Ok(Some(replacement))` becomes the new current event (after the
    /// identity-field merge); `Ok(None)` leaves it untouched. A plugin
    /// error is logged and that plugin is skipped — the event it received
    /// is passed on unchanged.
    pub async fn on_event(&self, invocation: &Invocation, event: Event) -> Event {
        let mut current = event;
        for plugin in &self.plugins {
            match plugin.on_event(invocation, &current).await {
                Ok(Some(replacement)) => {
                    current = merge_identity_fields(current, replacement);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "plugin on_event failed, using original event");
                }
            }
        }
        current
    }
}

/// Fill-if-empty merge: any identity field the replacement left empty is
/// copied over from the original. Never overwrites a field the
/// replacement set explicitly.
fn merge_identity_fields(original: Event, mut replacement: Event) -> Event {
    if replacement.request_id.is_empty() {
        replacement.request_id = original.request_id;
    }
    if replacement.invocation_id.is_empty() {
        replacement.invocation_id = original.invocation_id;
    }
    if replacement.parent_invocation_id.is_none() {
        replacement.parent_invocation_id = original.parent_invocation_id;
    }
    if replacement.branch.is_none() {
        replacement.branch = original.branch;
    }
    if replacement.filter_key.is_none() {
        replacement.filter_key = original.filter_key;
    }
    replacement
}
