use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::content::{Choice, ContentPart, Role};

/// Inside a graph-completion's `state_delta`, this key carries the
/// JSON-encoded response id of the final LLM turn inside the graph. Used
/// by the session-write adapter to suppress a duplicate echo of the final
/// assistant choices in the runner-completion event.
pub const LAST_RESPONSE_ID_KEY: &str = "last_response_id";

/// Filter key assigned to an event that carries none, so every persisted
/// event has a branch the summary cascade can key off of.
pub const DEFAULT_FILTER_KEY: &str = "root";

/// Opaque-byte state delta. Values are stored as raw bytes (usually a
/// JSON-encoded payload) so the runner never has to understand the
/// shape of arbitrary agent state.
pub type StateDelta = HashMap<String, Vec<u8>>;

/// Read a `StateDelta` entry and deserialize it as JSON.
pub fn get_state_delta_json<T: DeserializeOwned>(delta: &StateDelta, key: &str) -> Option<T> {
    delta.get(key).and_then(|bytes| serde_json::from_slice(bytes).ok())
}

/// Deep-copy a state delta. Byte buffers are shared across the event
/// pipeline; every persistence boundary that retains them must copy,
/// never alias.
pub fn clone_state_delta(delta: &StateDelta) -> StateDelta {
    delta.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Classifies the kind of event carried in `response.object`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventObject {
    #[serde(rename = "chat.completion")]
    ChatCompletion,
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
    #[serde(rename = "graph.execution")]
    GraphExecution,
    #[serde(rename = "runner-completion")]
    RunnerCompletion,
    Error,
}

/// The response payload of an event, when it carries one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub object: EventObject,
    pub choices: Vec<Choice>,
    pub done: bool,
    pub is_partial: bool,
}

impl Response {
    pub fn new(id: impl Into<String>, object: EventObject) -> Self {
        Self {
            id: id.into(),
            object,
            choices: Vec::new(),
            done: false,
            is_partial: false,
        }
    }
}

/// An event's error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// The unit of communication flowing through the Event Loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_invocation_id: Option<String>,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_key: Option<String>,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_delta: Option<StateDelta>,
    #[serde(default)]
    pub requires_completion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<serde_json::Value>,
    #[serde(default)]
    pub skip_summarization: bool,
    #[serde(default)]
    pub long_running_tool_ids: Vec<String>,
}

impl Event {
    pub fn new(id: impl Into<String>, invocation_id: impl Into<String>, request_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            invocation_id: invocation_id.into(),
            parent_invocation_id: None,
            request_id: request_id.into(),
            branch: None,
            filter_key: None,
            author: author.into(),
            timestamp: Utc::now(),
            response: None,
            error: None,
            state_delta: None,
            requires_completion: false,
            structured_output: None,
            skip_summarization: false,
            long_running_tool_ids: Vec::new(),
        }
    }

    /// *user-message*: role user, non-empty text or content-parts.
    pub fn is_user_message(&self) -> bool {
        self.response.as_ref().is_some_and(|r| {
            r.choices
                .iter()
                .any(|c| c.role == Some(Role::User) && c.has_valid_content())
        })
    }

    /// *tool-call-response*: at least one choice carries a `ToolCall` part.
    pub fn is_tool_call_response(&self) -> bool {
        self.response.as_ref().is_some_and(|r| {
            r.choices
                .iter()
                .any(|c| c.content_parts.iter().any(|p| matches!(p, ContentPart::ToolCall { .. })))
        })
    }

    /// *tool-result-response*: at least one choice carries a `ToolResult` part.
    pub fn is_tool_result_response(&self) -> bool {
        self.response.as_ref().is_some_and(|r| {
            r.choices
                .iter()
                .any(|c| c.content_parts.iter().any(|p| matches!(p, ContentPart::ToolResult { .. })))
        })
    }

    /// *valid-content*: non-empty text in at least one choice, or
    /// non-empty content-parts.
    pub fn is_valid_content(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|r| r.choices.iter().any(Choice::has_valid_content))
    }

    /// *graph-completion*: `done=true` and `object = graph-execution`.
    pub fn is_graph_completion(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|r| r.done && r.object == EventObject::GraphExecution)
    }

    /// *runner-completion*: `done=true` and `object = runner-completion`.
    pub fn is_runner_completion(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|r| r.done && r.object == EventObject::RunnerCompletion)
    }

    /// Whether this event is a non-partial chunk (i.e. safe to persist
    /// under the partial-chunk rule).
    pub fn is_partial(&self) -> bool {
        self.response.as_ref().is_some_and(|r| r.is_partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event() -> Event {
        Event::new("e1", "inv1", "req1", "agent")
    }

    #[test]
    fn user_message_predicate() {
        let mut e = base_event();
        e.response = Some(Response {
            id: "r1".into(),
            object: EventObject::ChatCompletion,
            choices: vec![Choice::text(Role::User, "hello")],
            done: false,
            is_partial: false,
        });
        assert!(e.is_user_message());
    }

    #[test]
    fn user_message_predicate_false_for_empty_text() {
        let mut e = base_event();
        e.response = Some(Response {
            id: "r1".into(),
            object: EventObject::ChatCompletion,
            choices: vec![Choice::text(Role::User, "")],
            done: false,
            is_partial: false,
        });
        assert!(!e.is_user_message());
    }

    #[test]
    fn graph_completion_predicate() {
        let mut e = base_event();
        e.response = Some(Response {
            id: "r1".into(),
            object: EventObject::GraphExecution,
            choices: vec![],
            done: true,
            is_partial: false,
        });
        assert!(e.is_graph_completion());
        assert!(!e.is_runner_completion());
    }

    #[test]
    fn runner_completion_predicate() {
        let mut e = base_event();
        e.response = Some(Response {
            id: "r1".into(),
            object: EventObject::RunnerCompletion,
            choices: vec![],
            done: true,
            is_partial: false,
        });
        assert!(e.is_runner_completion());
    }

    #[test]
    fn partial_chunk_is_never_valid_for_persistence_via_is_partial() {
        let mut e = base_event();
        e.response = Some(Response {
            id: "r1".into(),
            object: EventObject::ChatCompletionChunk,
            choices: vec![Choice::text(Role::Assistant, "partial")],
            done: false,
            is_partial: true,
        });
        assert!(e.is_partial());
        assert!(e.is_valid_content());
    }

    #[test]
    fn state_delta_roundtrip_json() {
        let mut delta: StateDelta = HashMap::new();
        delta.insert(
            LAST_RESPONSE_ID_KEY.into(),
            serde_json::to_vec(&"resp-123".to_string()).unwrap(),
        );
        let value: Option<String> = get_state_delta_json(&delta, LAST_RESPONSE_ID_KEY);
        assert_eq!(value.as_deref(), Some("resp-123"));
    }

    #[test]
    fn clone_state_delta_is_independent() {
        let mut delta: StateDelta = HashMap::new();
        delta.insert("k".into(), vec![1, 2, 3]);
        let mut cloned = clone_state_delta(&delta);
        cloned.get_mut("k").unwrap().push(4);
        assert_eq!(delta.get("k").unwrap(), &vec![1, 2, 3]);
    }
}
