/// Shared error type used across the runner-core workspace.
///
/// Variants map onto the error taxonomy: configuration failures are
/// returned synchronously from `Run`, session/agent failures are either
/// returned synchronously (pre-dispatch) or surfaced as an error event on
/// the stream (mid-run), and Ralph-Loop failures always surface as a
/// `stop-agent-error` event.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("session: {0}")]
    Session(String),

    #[error("agent dispatch: {0}")]
    AgentDispatch(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent runtime: {0}")]
    AgentRuntime(String),

    #[error("stop-agent-error: {0}")]
    StopAgent(String),

    #[error("verify command failed: {0}")]
    VerifyCommand(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
