//! Static and dynamic agent lookup, implementing the five-rule
//! agent-selection order used by `Runner::run`.

use std::collections::HashMap;
use std::sync::Arc;

use runner_domain::agent::{Agent, AgentFactory};
use runner_domain::error::{Error, Result};
use runner_domain::invocation::RunOptions;

/// A static table of named agents plus a fallback factory table, with an
/// optional default name tried before falling back to a factory.
pub struct AgentRegistry {
    by_name: HashMap<String, Arc<dyn Agent>>,
    default_name: Option<String>,
    factories: HashMap<String, Arc<dyn AgentFactory>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            default_name: None,
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let name = agent.info().name;
        self.by_name.insert(name, agent);
    }

    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default_name = Some(name.into());
    }

    pub fn register_factory(&mut self, name: impl Into<String>, factory: Arc<dyn AgentFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.by_name.get(name).cloned()
    }

    /// Resolve the agent for a run per the five-rule order:
    /// explicit override, `agent_by_name` in the static table, the
    /// registry's default name, a matching factory, else `AgentNotFound`.
    pub async fn resolve(&self, options: &RunOptions) -> Result<Arc<dyn Agent>> {
        if let Some(agent) = &options.agent_override {
            return Ok(agent.clone());
        }

        if let Some(name) = &options.agent_by_name {
            if let Some(agent) = self.by_name.get(name) {
                return Ok(agent.clone());
            }
        }

        if let Some(default_name) = &self.default_name {
            if let Some(agent) = self.by_name.get(default_name) {
                return Ok(agent.clone());
            }
        }

        let factory_name = options
            .agent_by_name
            .as_deref()
            .or(self.default_name.as_deref());
        if let Some(name) = factory_name {
            if let Some(factory) = self.factories.get(name) {
                return factory.build(name).await;
            }
        }

        Err(Error::AgentNotFound(
            factory_name.unwrap_or("<none>").to_string(),
        ))
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
