use serde::Serialize;

/// Structured trace events emitted across the runner-core workspace.
/// Each variant is logged as a single `tracing::info!` call carrying the
/// serialized event — downstream log pipelines can filter on `event`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    RunStarted {
        request_id: String,
        invocation_id: String,
        agent_name: String,
    },
    SeedMessagesAppended {
        request_id: String,
        count: usize,
    },
    UserMessageAppended {
        request_id: String,
        deduplicated: bool,
    },
    EventPersisted {
        request_id: String,
        event_id: String,
    },
    EventSkipped {
        request_id: String,
        event_id: String,
        reason: String,
    },
    RunnerCompletionEmitted {
        request_id: String,
    },
    SummaryJobEnqueued {
        request_id: String,
        filter_key: String,
    },
    MemoryJobEnqueued {
        request_id: String,
    },
    RunCancelled {
        request_id: String,
        found: bool,
    },
    RunUnregistered {
        request_id: String,
    },
    RalphIterationStarted {
        request_id: String,
        iteration: u32,
    },
    RalphIterationPassed {
        request_id: String,
        iteration: u32,
    },
    RalphIterationFailed {
        request_id: String,
        iteration: u32,
        reason: String,
    },
    VerifyCommandRun {
        request_id: String,
        exit_code: Option<i32>,
        timed_out: bool,
    },
    PluginReplacedEvent {
        request_id: String,
        event_id: String,
    },
    FlushRequested {
        request_id: String,
    },
    FlushCompleted {
        request_id: String,
    },
    EventLoopPanicRecovered {
        request_id: String,
        message: String,
        backtrace: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "runner_event");
    }
}
