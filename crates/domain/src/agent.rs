use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::ExecContext;
use crate::content::ToolDefinition;
use crate::error::Result;
use crate::event::Event;
use crate::invocation::Invocation;
use crate::stream::BoxStream;

/// Static description of an agent, returned by `Agent::info`.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
}

/// The dynamic-dispatch contract every agent (and the Ralph Loop wrapper,
/// which is itself an agent composing an inner one) implements. The
/// runner never knows whether it is talking to a leaf agent or a
/// composed wrapper.
#[async_trait]
pub trait Agent: Send + Sync {
    fn info(&self) -> AgentInfo;

    fn sub_agents(&self) -> Vec<Arc<dyn Agent>>;

    /// Default implementation scans `sub_agents` by name; leaf agents with
    /// no children may leave this unoverridden.
    fn find_sub_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.sub_agents().into_iter().find(|a| a.info().name == name)
    }

    fn tools(&self) -> Vec<ToolDefinition>;

    /// Drive the agent for one invocation. The returned stream must be
    /// closed by the agent once it has no more events to produce.
    async fn run(&self, ctx: ExecContext, invocation: Arc<Invocation>) -> Result<BoxStream<'static, Event>>;
}

/// Builds an agent instance by name, consulted when an `agentByName`
/// option misses the static registry (agent-selection rule 4).
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn build(&self, name: &str) -> Result<Arc<dyn Agent>>;
}
