//! Session-Write Adapter: persistence gating, the error-content
//! invariant, graph-completion handling, and runner-completion assembly.

use std::collections::HashSet;
use std::sync::Arc;

use runner_domain::content::{Choice, Role};
use runner_domain::event::{clone_state_delta, get_state_delta_json, Event, EventObject, Response, StateDelta, DEFAULT_FILTER_KEY, LAST_RESPONSE_ID_KEY};
use runner_domain::invocation::ConversationKey;
use runner_sessions::SessionService;

const ERROR_DEFAULT_CONTENT: &str = "An error occurred during execution. Please contact the service provider.";

/// Whether an event qualifies for persistence: a non-empty state delta,
/// or a non-partial response with valid content. Partial chunks are
/// never persisted directly.
pub fn should_persist(event: &Event) -> bool {
    let has_state = event.state_delta.as_ref().is_some_and(|d| !d.is_empty());
    let has_final_content = event.response.is_some() && !event.is_partial() && event.is_valid_content();
    has_state || has_final_content
}

/// Apply the error-content invariant: if the event carries an `error` and
/// has no valid content, synthesize a default assistant choice so the
/// error is never persisted as empty content.
pub fn apply_error_content_invariant(mut event: Event) -> Event {
    if event.error.is_some() && !event.is_valid_content() {
        let mut choice = Choice::text(Role::Assistant, ERROR_DEFAULT_CONTENT);
        choice.finish_reason = Some("error".to_string());
        let response = event.response.get_or_insert_with(|| Response::new(event.id.clone(), EventObject::Error));
        response.choices = vec![choice];
    }
    event
}

/// Graph-completion events are persisted with a deep-copied state delta
/// and nulled-out choices: the individual LLM turns inside the graph are
/// already persisted, so the completion itself must not duplicate the
/// final assistant message.
pub fn prepare_graph_completion_for_persistence(event: &Event) -> Event {
    let mut clone = event.clone();
    if let Some(delta) = &event.state_delta {
        clone.state_delta = Some(clone_state_delta(delta));
    }
    if let Some(response) = &mut clone.response {
        response.choices = Vec::new();
    }
    clone
}

/// Whether the just-persisted event should enqueue an asynchronous
/// per-filter summary job: not a user message, not a tool call or tool
/// result, and carrying valid content.
pub fn should_enqueue_summary(event: &Event) -> bool {
    !event.is_user_message() && !event.is_tool_call_response() && !event.is_tool_result_response() && event.is_valid_content()
}

/// Persist `event` after applying the error-content invariant and
/// graph-completion handling, then (best-effort) enqueue the follow-up
/// summary job. Returns the (possibly rewritten) event that was actually
/// persisted, or `None` if the event did not qualify for persistence.
pub async fn persist_event(
    session_service: &Arc<dyn SessionService>,
    key: &ConversationKey,
    event: Event,
) -> runner_domain::error::Result<Option<Event>> {
    let mut event = apply_error_content_invariant(event);
    if !should_persist(&event) {
        return Ok(None);
    }
    if event.filter_key.is_none() {
        event.filter_key = Some(DEFAULT_FILTER_KEY.to_string());
    }

    let to_store = if event.is_graph_completion() {
        prepare_graph_completion_for_persistence(&event)
    } else {
        event.clone()
    };

    session_service.append_event(key, to_store.clone()).await?;

    if should_enqueue_summary(&event) {
        let filter_key = event.filter_key.clone().unwrap_or_default();
        if let Err(err) = session_service.enqueue_summary_job(key, &filter_key, false).await {
            tracing::debug!(error = %err, "failed to enqueue summary job");
        }
    }

    Ok(Some(to_store))
}

/// Tracking set for the §4.2 step-3 de-duplication rule: records the
/// response id of every non-partial, valid-content assistant message
/// that is not itself a graph-completion.
#[derive(Default)]
pub struct EmittedAssistantResponseIds {
    ids: HashSet<String>,
}

impl EmittedAssistantResponseIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &Event) {
        if event.is_graph_completion() || event.is_partial() || !event.is_valid_content() {
            return;
        }
        if let Some(response) = &event.response {
            let is_assistant = response.choices.iter().any(|c| c.role == Some(Role::Assistant));
            if is_assistant {
                self.ids.insert(response.id.clone());
            }
        }
    }

    pub fn contains(&self, response_id: &str) -> bool {
        self.ids.contains(response_id)
    }
}

/// Accumulated state from graph-completion events observed during a run,
/// folded into the terminal runner-completion.
#[derive(Default)]
pub struct GraphCompletionCapture {
    pub final_state_delta: Option<StateDelta>,
    pub final_choices: Vec<Choice>,
}

impl GraphCompletionCapture {
    pub fn observe(&mut self, event: &Event) {
        if !event.is_graph_completion() {
            return;
        }
        if let Some(delta) = &event.state_delta {
            self.final_state_delta = Some(clone_state_delta(delta));
        }
        if let Some(response) = &event.response {
            self.final_choices = response.choices.clone();
        }
    }
}

/// Build the terminal runner-completion event per §4.5: a fresh id,
/// `done=true`, `is_partial=false`, with the captured graph-completion
/// state folded in and the final-choices echo suppressed when they
/// duplicate an already-emitted assistant response.
pub fn build_runner_completion(
    event_id: impl Into<String>,
    invocation_id: &str,
    request_id: &str,
    author: &str,
    capture: &GraphCompletionCapture,
    graph_emit_final_model_responses: bool,
    emitted: &EmittedAssistantResponseIds,
) -> Event {
    let id = event_id.into();
    let mut event = Event::new(id.clone(), invocation_id, request_id, author);
    let mut response = Response::new(id, EventObject::RunnerCompletion);
    response.done = true;
    response.is_partial = false;

    if let Some(delta) = &capture.final_state_delta {
        event.state_delta = Some(clone_state_delta(delta));

        let last_response_id: Option<String> = get_state_delta_json(delta, LAST_RESPONSE_ID_KEY);
        let duplicate = graph_emit_final_model_responses
            && last_response_id.is_some_and(|id| emitted.contains(&id));

        if !duplicate {
            response.choices = capture.final_choices.clone();
        }
    }

    event.response = Some(response);
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_domain::event::EventError;

    fn user_event(text: &str) -> Event {
        let mut event = Event::new("e1", "inv1", "req1", "agent");
        event.response = Some(Response {
            id: "r1".into(),
            object: EventObject::ChatCompletion,
            choices: vec![Choice::text(Role::User, text)],
            done: false,
            is_partial: false,
        });
        event
    }

    #[test]
    fn should_persist_requires_non_partial_valid_content() {
        let mut event = user_event("hi");
        assert!(should_persist(&event));
        event.response.as_mut().unwrap().is_partial = true;
        assert!(!should_persist(&event));
    }

    #[test]
    fn should_persist_true_for_nonempty_state_delta_alone() {
        let mut event = Event::new("e1", "inv1", "req1", "agent");
        event.state_delta = Some(StateDelta::from([("k".to_string(), vec![1])]));
        assert!(should_persist(&event));
    }

    #[test]
    fn error_content_invariant_synthesizes_default_choice() {
        let mut event = Event::new("e1", "inv1", "req1", "agent");
        event.error = Some(EventError {
            error_type: "boom".into(),
            message: "boom".into(),
        });
        let event = apply_error_content_invariant(event);
        let response = event.response.unwrap();
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].content.as_deref(), Some(ERROR_DEFAULT_CONTENT));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("error"));
    }

    #[test]
    fn error_content_invariant_leaves_populated_content_alone() {
        let mut event = user_event("already has content");
        event.error = Some(EventError {
            error_type: "boom".into(),
            message: "boom".into(),
        });
        let event = apply_error_content_invariant(event);
        assert_eq!(event.response.unwrap().choices[0].extract_text(), "already has content");
    }

    #[test]
    fn graph_completion_persistence_clears_choices_and_copies_delta() {
        let mut event = Event::new("e1", "inv1", "req1", "agent");
        event.state_delta = Some(StateDelta::from([("final_key".to_string(), b"final_value".to_vec())]));
        event.response = Some(Response {
            id: "r1".into(),
            object: EventObject::GraphExecution,
            choices: vec![Choice::text(Role::Assistant, "Graph execution completed")],
            done: true,
            is_partial: false,
        });

        let prepared = prepare_graph_completion_for_persistence(&event);
        assert!(prepared.response.unwrap().choices.is_empty());
        assert_eq!(prepared.state_delta.unwrap().get("final_key").unwrap(), b"final_value");
    }

    #[test]
    fn summary_enqueue_skipped_for_user_and_tool_events() {
        assert!(!should_enqueue_summary(&user_event("hi")));

        let mut tool_call = Event::new("e1", "inv1", "req1", "agent");
        tool_call.response = Some(Response {
            id: "r1".into(),
            object: EventObject::ChatCompletion,
            choices: vec![Choice {
                role: Some(Role::Assistant),
                content: None,
                content_parts: vec![runner_domain::content::ContentPart::ToolCall {
                    call_id: "c1".into(),
                    tool_name: "exec".into(),
                    arguments: serde_json::json!({}),
                }],
                finish_reason: None,
            }],
            done: false,
            is_partial: false,
        });
        assert!(!should_enqueue_summary(&tool_call));
    }

    #[test]
    fn summary_enqueue_true_for_plain_assistant_content() {
        let mut event = Event::new("e1", "inv1", "req1", "agent");
        event.response = Some(Response {
            id: "r1".into(),
            object: EventObject::ChatCompletion,
            choices: vec![Choice::text(Role::Assistant, "final answer")],
            done: false,
            is_partial: false,
        });
        assert!(should_enqueue_summary(&event));
    }

    #[test]
    fn graph_completion_echoes_final_choices_by_default() {
        let mut capture = GraphCompletionCapture::default();
        let mut graph_event = Event::new("g1", "inv1", "req1", "agent");
        graph_event.state_delta = Some(StateDelta::from([("final_key".to_string(), b"\"final_value\"".to_vec())]));
        graph_event.response = Some(Response {
            id: "r2".into(),
            object: EventObject::GraphExecution,
            choices: vec![Choice::text(Role::Assistant, "Graph execution completed")],
            done: true,
            is_partial: false,
        });
        capture.observe(&graph_event);

        let emitted = EmittedAssistantResponseIds::new();
        let completion = build_runner_completion("rc1", "inv1", "req1", "agent", &capture, true, &emitted);
        let response = completion.response.unwrap();
        assert_eq!(response.choices.len(), 1);
        assert_eq!(
            get_state_delta_json::<String>(completion.state_delta.as_ref().unwrap(), "final_key"),
            None
        );
    }

    #[tokio::test]
    async fn persist_event_defaults_an_unset_filter_key() {
        use runner_domain::invocation::ConversationKey;
        use runner_sessions::{InMemorySessionService, SessionService};

        let service: Arc<dyn SessionService> = Arc::new(InMemorySessionService::default());
        let key = ConversationKey::new("app", "u1", "c1");
        service.create_session(&key).await.unwrap();

        let event = user_event("hi");
        assert!(event.filter_key.is_none());
        let stored = persist_event(&service, &key, event).await.unwrap().unwrap();
        assert_eq!(stored.filter_key.as_deref(), Some(DEFAULT_FILTER_KEY));
    }

    #[test]
    fn graph_completion_dedup_suppresses_duplicate_echo() {
        let mut emitted = EmittedAssistantResponseIds::new();
        let mut assistant_event = Event::new("a1", "inv1", "req1", "agent");
        assistant_event.response = Some(Response {
            id: "A".into(),
            object: EventObject::ChatCompletion,
            choices: vec![Choice::text(Role::Assistant, "final")],
            done: false,
            is_partial: false,
        });
        emitted.record(&assistant_event);

        let mut capture = GraphCompletionCapture::default();
        let mut graph_event = Event::new("g1", "inv1", "req1", "agent");
        let mut delta = StateDelta::new();
        delta.insert(LAST_RESPONSE_ID_KEY.to_string(), serde_json::to_vec(&"A".to_string()).unwrap());
        graph_event.state_delta = Some(delta);
        graph_event.response = Some(Response {
            id: "r2".into(),
            object: EventObject::GraphExecution,
            choices: vec![Choice::text(Role::Assistant, "final")],
            done: true,
            is_partial: false,
        });
        capture.observe(&graph_event);

        let completion = build_runner_completion("rc1", "inv1", "req1", "agent", &capture, true, &emitted);
        assert!(completion.response.unwrap().choices.is_empty());
    }
}
