//! The Event Loop: one Tokio task per run, owning the Invocation and the
//! output channel. Applies the plugin pipeline and persistence gating to
//! every event the agent stream produces, then always emits a terminal
//! runner-completion event on teardown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use runner_domain::cancel::ExecContext;
use runner_domain::event::Event;
use runner_domain::invocation::{append_event_notice_key, ConversationKey, Invocation};
use runner_domain::stream::BoxStream;
use runner_domain::trace::TraceEvent;
use runner_sessions::{MemoryService, SessionService};

use crate::plugin_manager::PluginManager;
use crate::registry::RunRegistry;
use crate::session_adapter::{build_runner_completion, persist_event, EmittedAssistantResponseIds, GraphCompletionCapture};

/// How often the loop re-checks `ExecContext::is_cancelled` while waiting
/// on the agent stream. `CancelToken` is a plain flag, not a wakeable
/// future, so this polling interval stands in for the execution-context
/// "done" signal.
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A request to drain currently-buffered agent events without waiting for
/// the stream to close; the sender is notified via `ack` once the drain
/// completes.
pub struct FlushRequest {
    pub ack: oneshot::Sender<()>,
}

pub struct EventLoopHandle {
    pub flush_tx: mpsc::Sender<FlushRequest>,
}

/// Collaborators the Event Loop needs from its caller, grouped so
/// `spawn`'s signature stays manageable.
pub struct EventLoopDeps {
    pub session_service: Arc<dyn SessionService>,
    pub memory_service: Option<Arc<dyn MemoryService>>,
    pub plugin_manager: Arc<PluginManager>,
    pub registry: Arc<RunRegistry>,
    pub graph_emit_final_model_responses: bool,
}

/// Spawn the Event Loop task for an already-dispatched agent stream.
/// `invocation.request_id` must already be registered in `deps.registry`.
/// Returns the processed-event stream for the caller plus a flush handle.
pub fn spawn(invocation: Arc<Invocation>, agent_stream: BoxStream<'static, Event>, ctx: ExecContext, deps: EventLoopDeps) -> (BoxStream<'static, Event>, EventLoopHandle) {
    let (flush_tx, flush_rx) = mpsc::channel::<FlushRequest>(1);
    let (out_tx, out_rx) = mpsc::channel::<Event>(64);

    let request_id = invocation.request_id.clone();
    let span = tracing::info_span!("event_loop", request_id = %request_id, invocation_id = %invocation.invocation_id);

    tokio::spawn(run_loop(invocation, agent_stream, ctx, deps, out_tx, flush_rx).instrument(span));

    (Box::pin(ReceiverStream::new(out_rx)), EventLoopHandle { flush_tx })
}

struct LoopState {
    emitted: EmittedAssistantResponseIds,
    capture: GraphCompletionCapture,
}

async fn run_loop(invocation: Arc<Invocation>, mut agent_stream: BoxStream<'static, Event>, ctx: ExecContext, deps: EventLoopDeps, out_tx: mpsc::Sender<Event>, mut flush_rx: mpsc::Receiver<FlushRequest>) {
    let request_id = invocation.request_id.clone();
    let conversation_key = invocation.conversation_key.clone();
    let mut state = LoopState {
        emitted: EmittedAssistantResponseIds::new(),
        capture: GraphCompletionCapture::default(),
    };
    let mut agent_closed = false;
    let mut stop_loop = false;

    TraceEvent::RunStarted {
        request_id: request_id.clone(),
        invocation_id: invocation.invocation_id.clone(),
        agent_name: invocation.agent.info().name,
    }
    .emit();

    while !agent_closed && !stop_loop && !ctx.is_cancelled() && !ctx.deadline_exceeded() {
        tokio::select! {
            biased;

            Some(req) = flush_rx.recv() => {
                TraceEvent::FlushRequested { request_id: request_id.clone() }.emit();
                if !drain_buffered(&mut agent_stream, &mut state, &conversation_key, &deps, &out_tx, &request_id, &invocation, &ctx).await {
                    stop_loop = true;
                }
                let _ = req.ack.send(());
                TraceEvent::FlushCompleted { request_id: request_id.clone() }.emit();
            }

            maybe_event = agent_stream.next() => {
                match maybe_event {
                    Some(event) => {
                        if !guarded_process_event(event, &mut state, &conversation_key, &deps, &out_tx, &request_id, &invocation, &ctx).await {
                            stop_loop = true;
                        }
                    }
                    None => agent_closed = true,
                }
            }

            _ = tokio::time::sleep(CANCELLATION_POLL_INTERVAL) => {}
        }
    }

    guarded_teardown(invocation, conversation_key, state, deps, out_tx, request_id, ctx).await;
}

/// Runs `process_event` behind `catch_unwind` so a panic inside a plugin,
/// the stream-mode filter, or the session service terminates only this
/// run rather than unwinding the whole Event Loop task. Returns `false`
/// when the loop must stop: either the panic was caught, or the
/// processed-event channel is gone (the caller dropped the stream).
#[allow(clippy::too_many_arguments)]
async fn guarded_process_event(event: Event, state: &mut LoopState, conversation_key: &ConversationKey, deps: &EventLoopDeps, out_tx: &mpsc::Sender<Event>, request_id: &str, invocation: &Arc<Invocation>, ctx: &ExecContext) -> bool {
    match AssertUnwindSafe(process_event(event, state, conversation_key, deps, out_tx, request_id, invocation, ctx)).catch_unwind().await {
        Ok(should_continue) => should_continue,
        Err(payload) => {
            log_panic(request_id, payload);
            false
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_event(event: Event, state: &mut LoopState, conversation_key: &ConversationKey, deps: &EventLoopDeps, out_tx: &mpsc::Sender<Event>, request_id: &str, invocation: &Arc<Invocation>, ctx: &ExecContext) -> bool {
    let event = deps.plugin_manager.on_event(invocation, event).await;

    state.emitted.record(&event);

    let requires_completion = event.requires_completion;
    let event_id = event.id.clone();

    match persist_event(&deps.session_service, conversation_key, event.clone()).await {
        Ok(Some(_)) => {
            TraceEvent::EventPersisted {
                request_id: request_id.to_string(),
                event_id: event_id.clone(),
            }
            .emit();
        }
        Ok(None) => {
            TraceEvent::EventSkipped {
                request_id: request_id.to_string(),
                event_id: event_id.clone(),
                reason: "does not qualify for persistence".to_string(),
            }
            .emit();
        }
        Err(err) => {
            tracing::warn!(error = %err, event_id = %event_id, "failed to persist event");
        }
    }

    state.capture.observe(&event);

    if requires_completion {
        invocation.completion_notices.notify(&append_event_notice_key(&event_id));
    }

    if let Some(handle) = deps.registry.lookup(request_id) {
        handle.record_event();
    }

    if invocation.options.stream_mode_filter.should_emit(&event) {
        send_racing_cancellation(out_tx, event, ctx).await
    } else {
        true
    }
}

/// Sends on the processed-event channel, racing the send against the
/// execution context's cancellation/deadline signal so a stalled
/// consumer (a full channel in detached-cancel mode) cannot block the
/// loop past its own deadline. Returns `false` on a genuine send
/// failure (the receiver was dropped) so the caller treats it as a
/// loop-terminating error; cancellation/deadline during the race also
/// returns `false`, matching the outer loop's own teardown condition.
async fn send_racing_cancellation(out_tx: &mpsc::Sender<Event>, event: Event, ctx: &ExecContext) -> bool {
    tokio::pin! {
        let send_fut = out_tx.send(event);
    }
    loop {
        tokio::select! {
            biased;

            result = &mut send_fut => {
                return result.is_ok();
            }

            _ = tokio::time::sleep(CANCELLATION_POLL_INTERVAL) => {
                if ctx.is_cancelled() || ctx.deadline_exceeded() {
                    return false;
                }
            }
        }
    }
}

/// Non-blocking drain of whatever the agent stream currently has
/// buffered: stop as soon as polling it would need to wait. Returns
/// `false` if a guarded event terminated the loop mid-drain.
#[allow(clippy::too_many_arguments)]
async fn drain_buffered(agent_stream: &mut BoxStream<'static, Event>, state: &mut LoopState, conversation_key: &ConversationKey, deps: &EventLoopDeps, out_tx: &mpsc::Sender<Event>, request_id: &str, invocation: &Arc<Invocation>, ctx: &ExecContext) -> bool {
    loop {
        match agent_stream.next().now_or_never() {
            Some(Some(event)) => {
                if !guarded_process_event(event, state, conversation_key, deps, out_tx, request_id, invocation, ctx).await {
                    return false;
                }
            }
            Some(None) | None => return true,
        }
    }
}

/// Runs the terminal-completion emission behind `catch_unwind` and then
/// unconditionally unregisters the run and cancels its token regardless
/// of whether emission succeeded, panicked, or was itself already
/// unwinding — a run can never be left registered just because building
/// or persisting its runner-completion event panicked.
async fn guarded_teardown(invocation: Arc<Invocation>, conversation_key: ConversationKey, state: LoopState, deps: EventLoopDeps, out_tx: mpsc::Sender<Event>, request_id: String, ctx: ExecContext) {
    if let Err(payload) = AssertUnwindSafe(emit_runner_completion(&invocation, &conversation_key, &state, &deps, &out_tx, &request_id)).catch_unwind().await {
        log_panic(&request_id, payload);
    }

    invocation.completion_notices.clear();
    deps.registry.unregister(&request_id);
    TraceEvent::RunUnregistered { request_id: request_id.clone() }.emit();
    ctx.cancel_token().cancel();
}

async fn emit_runner_completion(invocation: &Arc<Invocation>, conversation_key: &ConversationKey, state: &LoopState, deps: &EventLoopDeps, out_tx: &mpsc::Sender<Event>, request_id: &str) {
    let completion = build_runner_completion(
        format!("{request_id}-runner-completion"),
        &invocation.invocation_id,
        request_id,
        &invocation.agent.info().name,
        &state.capture,
        deps.graph_emit_final_model_responses,
        &state.emitted,
    );

    if let Err(err) = persist_event(&deps.session_service, conversation_key, completion.clone()).await {
        tracing::warn!(error = %err, "failed to persist runner-completion event");
    }
    TraceEvent::RunnerCompletionEmitted { request_id: request_id.to_string() }.emit();
    let _ = out_tx.send(completion).await;

    if let Some(memory) = &deps.memory_service {
        match deps.session_service.get_session(conversation_key).await {
            Ok(Some(session)) => {
                if let Err(err) = memory.enqueue_auto_memory_job(&session).await {
                    tracing::debug!(error = %err, "failed to enqueue memory job");
                } else {
                    TraceEvent::MemoryJobEnqueued { request_id: request_id.to_string() }.emit();
                }
            }
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "failed to load session for memory job"),
        }
    }
}

/// Extracts a message from a caught panic payload and logs/traces it
/// with a captured backtrace. `RUST_BACKTRACE` controls whether the
/// backtrace is actually resolved; unset, it logs as "disabled".
fn log_panic(request_id: &str, payload: Box<dyn std::any::Any + Send>) {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    let backtrace = std::backtrace::Backtrace::force_capture().to_string();

    tracing::error!(request_id = %request_id, panic = %message, "event loop panic recovered, terminating this run");
    TraceEvent::EventLoopPanicRecovered {
        request_id: request_id.to_string(),
        message,
        backtrace,
    }
    .emit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use runner_domain::agent::{Agent, AgentInfo};
    use runner_domain::cancel::CancelToken;
    use runner_domain::content::{Choice, Role, ToolDefinition};
    use runner_domain::error::Result;
    use runner_domain::event::{EventObject, Response};
    use runner_domain::invocation::{EmitAll, RunOptions};
    use runner_sessions::InMemorySessionService;

    struct StubAgent;
    #[async_trait]
    impl Agent for StubAgent {
        fn info(&self) -> AgentInfo {
            AgentInfo { name: "stub".into(), description: String::new() }
        }
        fn sub_agents(&self) -> Vec<Arc<dyn Agent>> {
            Vec::new()
        }
        fn tools(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
        async fn run(&self, _ctx: ExecContext, _invocation: Arc<Invocation>) -> Result<BoxStream<'static, Event>> {
            unimplemented!()
        }
    }

    fn assistant_event(id: &str, text: &str) -> Event {
        let mut event = Event::new(id, "inv1", "req1", "stub");
        event.response = Some(Response {
            id: format!("{id}-resp"),
            object: EventObject::ChatCompletion,
            choices: vec![Choice::text(Role::Assistant, text)],
            done: false,
            is_partial: false,
        });
        event
    }

    #[tokio::test]
    async fn every_run_emits_exactly_one_runner_completion() {
        let session_service: Arc<dyn SessionService> = Arc::new(InMemorySessionService::default());
        let key = ConversationKey::new("app", "u1", "c1");
        session_service.create_session(&key).await.unwrap();

        let invocation = Arc::new(Invocation::new(
            "inv1",
            "req1",
            Arc::new(StubAgent) as Arc<dyn Agent>,
            key.clone(),
            None,
            Arc::new(RunOptions {
                stream_mode_filter: Arc::new(EmitAll),
                ..RunOptions::default()
            }),
        ));

        let events = vec![assistant_event("e1", "hello")];
        let agent_stream: BoxStream<'static, Event> = Box::pin(futures_util::stream::iter(events));

        let deps = EventLoopDeps {
            session_service: session_service.clone(),
            memory_service: None,
            plugin_manager: Arc::new(PluginManager::new(Vec::new())),
            registry: Arc::new(RunRegistry::new()),
            graph_emit_final_model_responses: true,
        };
        deps.registry.register("req1", "inv1", "stub", &key.as_key(), CancelToken::new()).unwrap();

        let ctx = ExecContext::new(CancelToken::new(), None);
        let (stream, _handle) = spawn(invocation, agent_stream, ctx, deps);

        let collected: Vec<Event> = stream.collect().await;
        let completions: Vec<_> = collected.iter().filter(|e| e.is_runner_completion()).collect();
        assert_eq!(completions.len(), 1);

        let session = session_service.get_session(&key).await.unwrap().unwrap();
        assert!(session.events.iter().any(|e| e.is_runner_completion()));
    }

    #[tokio::test]
    async fn expired_deadline_tears_down_even_with_an_open_agent_stream() {
        let session_service: Arc<dyn SessionService> = Arc::new(InMemorySessionService::default());
        let key = ConversationKey::new("app", "u1", "c1");
        session_service.create_session(&key).await.unwrap();

        let invocation = Arc::new(Invocation::new(
            "inv1",
            "req1",
            Arc::new(StubAgent) as Arc<dyn Agent>,
            key.clone(),
            None,
            Arc::new(RunOptions {
                stream_mode_filter: Arc::new(EmitAll),
                ..RunOptions::default()
            }),
        ));

        // An agent stream that never closes on its own.
        let agent_stream: BoxStream<'static, Event> = Box::pin(futures_util::stream::pending());

        let deps = EventLoopDeps {
            session_service: session_service.clone(),
            memory_service: None,
            plugin_manager: Arc::new(PluginManager::new(Vec::new())),
            registry: Arc::new(RunRegistry::new()),
            graph_emit_final_model_responses: true,
        };
        deps.registry.register("req1", "inv1", "stub", &key.as_key(), CancelToken::new()).unwrap();

        let past_deadline = chrono::Utc::now() - chrono::Duration::seconds(1);
        let ctx = ExecContext::new(CancelToken::new(), Some(past_deadline));
        let (stream, _handle) = spawn(invocation, agent_stream, ctx, deps);

        let collected: Vec<Event> = tokio::time::timeout(Duration::from_secs(5), stream.collect()).await.expect("teardown must run despite a stream that never closes");
        assert_eq!(collected.iter().filter(|e| e.is_runner_completion()).count(), 1);
    }

    struct PanickingPlugin;
    #[async_trait]
    impl runner_domain::plugin::Plugin for PanickingPlugin {
        async fn on_event(&self, _invocation: &Invocation, _event: &Event) -> Result<Option<Event>> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panic_in_plugin_still_yields_exactly_one_runner_completion() {
        let session_service: Arc<dyn SessionService> = Arc::new(InMemorySessionService::default());
        let key = ConversationKey::new("app", "u1", "c1");
        session_service.create_session(&key).await.unwrap();

        let invocation = Arc::new(Invocation::new(
            "inv1",
            "req1",
            Arc::new(StubAgent) as Arc<dyn Agent>,
            key.clone(),
            None,
            Arc::new(RunOptions {
                stream_mode_filter: Arc::new(EmitAll),
                ..RunOptions::default()
            }),
        ));

        let events = vec![assistant_event("e1", "hello"), assistant_event("e2", "world")];
        let agent_stream: BoxStream<'static, Event> = Box::pin(futures_util::stream::iter(events));

        let registry = Arc::new(RunRegistry::new());
        let deps = EventLoopDeps {
            session_service: session_service.clone(),
            memory_service: None,
            plugin_manager: Arc::new(PluginManager::new(vec![Arc::new(PanickingPlugin)])),
            registry: registry.clone(),
            graph_emit_final_model_responses: true,
        };
        registry.register("req1", "inv1", "stub", &key.as_key(), CancelToken::new()).unwrap();

        let ctx = ExecContext::new(CancelToken::new(), None);
        let (stream, _handle) = spawn(invocation, agent_stream, ctx, deps);

        let collected: Vec<Event> = tokio::time::timeout(Duration::from_secs(5), stream.collect()).await.expect("a panic inside the loop must not hang teardown");
        assert_eq!(collected.iter().filter(|e| e.is_runner_completion()).count(), 1);

        assert!(registry.lookup("req1").is_none(), "a panicking run must still be unregistered");
    }
}
