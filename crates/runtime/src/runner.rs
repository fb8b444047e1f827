//! The top-level `Runner` and its `RunnerBuilder`: agent selection,
//! session seeding, dispatch, and the per-run Event Loop wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use runner_domain::agent::{Agent, AgentFactory};
use runner_domain::cancel::{CancelToken, ExecContext};
use runner_domain::config::RunnerConfig;
use runner_domain::content::{Choice, Role};
use runner_domain::error::{Error, Result};
use runner_domain::event::{Event, EventObject, Response};
use runner_domain::invocation::{ConversationKey, Invocation, RunOptions, SeedMessage};
use runner_domain::run::{RalphLoopConfig, RunStatusSnapshot};
use runner_domain::stream::BoxStream;
use runner_domain::trace::TraceEvent;
use runner_sessions::{InMemorySessionService, MemoryService, SessionService};

use crate::agent_registry::AgentRegistry;
use crate::event_loop::{self, EventLoopDeps};
use crate::plugin_manager::PluginManager;
use crate::ralph::{RalphAgent, SessionAppender};
use crate::registry::RunRegistry;

/// Appends Ralph Loop feedback messages to a session through the same
/// `SessionService` the runner itself writes through.
struct SessionServiceAppender {
    session_service: Arc<dyn SessionService>,
}

#[async_trait]
impl SessionAppender for SessionServiceAppender {
    async fn append_user_event(&self, conversation_key: &ConversationKey, text: String) -> Result<()> {
        let mut event = Event::new(Uuid::new_v4().to_string(), "", "", "user");
        event.response = Some(Response {
            id: Uuid::new_v4().to_string(),
            object: EventObject::ChatCompletion,
            choices: vec![Choice::text(Role::User, text)],
            done: false,
            is_partial: false,
        });
        self.session_service.append_event(conversation_key, event).await
    }
}

pub struct RunnerBuilder {
    app_name: String,
    agents: AgentRegistry,
    session_service: Option<Arc<dyn SessionService>>,
    owns_session_service: bool,
    memory_service: Option<Arc<dyn MemoryService>>,
    owns_memory_service: bool,
    plugins: Vec<Arc<dyn runner_domain::plugin::Plugin>>,
    ralph: Option<RalphLoopConfig>,
    config: RunnerConfig,
}

impl RunnerBuilder {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            agents: AgentRegistry::new(),
            session_service: None,
            owns_session_service: false,
            memory_service: None,
            owns_memory_service: false,
            plugins: Vec::new(),
            ralph: None,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.register(agent);
        self
    }

    pub fn with_default_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agents.set_default(name);
        self
    }

    pub fn with_agent_factory(mut self, name: impl Into<String>, factory: Arc<dyn AgentFactory>) -> Self {
        self.agents.register_factory(name, factory);
        self
    }

    /// Supplies a pre-built session service. The runner will NOT close it
    /// on `close()` — ownership stays with the caller.
    pub fn with_session_service(mut self, service: Arc<dyn SessionService>) -> Self {
        self.session_service = Some(service);
        self.owns_session_service = false;
        self
    }

    pub fn with_memory_service(mut self, service: Arc<dyn MemoryService>) -> Self {
        self.memory_service = Some(service);
        self.owns_memory_service = false;
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn runner_domain::plugin::Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_ralph_loop(mut self, config: RalphLoopConfig) -> Self {
        self.ralph = Some(config);
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Runner> {
        if let Some(ralph) = &self.ralph {
            ralph.validate()?;
        }
        for issue in self.config.validate() {
            if matches!(issue.severity, runner_domain::config::ConfigSeverity::Error) {
                return Err(Error::Config(issue.message));
            }
            tracing::warn!(message = %issue.message, "runner config warning");
        }

        let (session_service, owns_session_service) = match self.session_service {
            Some(svc) => (svc, self.owns_session_service),
            None => (Arc::new(InMemorySessionService::default()) as Arc<dyn SessionService>, true),
        };
        Ok(Runner {
            app_name: self.app_name,
            agents: self.agents,
            session_service,
            owns_session_service,
            memory_service: self.memory_service,
            owns_memory_service: self.owns_memory_service,
            plugins: self.plugins,
            registry: Arc::new(RunRegistry::new()),
            ralph: self.ralph,
            config: self.config,
            closed: AtomicBool::new(false),
        })
    }
}

/// The library's top-level entry point: resolves an agent, seeds and
/// appends messages, dispatches the (optionally Ralph-wrapped) agent,
/// and wires its stream through the Event Loop.
pub struct Runner {
    app_name: String,
    agents: AgentRegistry,
    session_service: Arc<dyn SessionService>,
    owns_session_service: bool,
    memory_service: Option<Arc<dyn MemoryService>>,
    owns_memory_service: bool,
    plugins: Vec<Arc<dyn runner_domain::plugin::Plugin>>,
    registry: Arc<RunRegistry>,
    ralph: Option<RalphLoopConfig>,
    config: RunnerConfig,
    closed: AtomicBool,
}

impl Runner {
    pub fn builder(app_name: impl Into<String>) -> RunnerBuilder {
        RunnerBuilder::new(app_name)
    }

    /// `caller_cancel`/`caller_deadline` model the caller's execution
    /// context; `options.max_run_duration` composes with the caller
    /// deadline via min-semantics.
    pub async fn run(&self, caller_cancel: CancelToken, caller_deadline: Option<DateTime<Utc>>, user_id: &str, conversation_id: &str, message: Option<SeedMessage>, options: RunOptions) -> Result<BoxStream<'static, Event>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Config("runner is closed".into()));
        }

        let conversation_key = ConversationKey::new(self.app_name.clone(), user_id, conversation_id);
        let mut session = match self.session_service.get_session(&conversation_key).await? {
            Some(s) => s,
            None => self.session_service.create_session(&conversation_key).await?,
        };

        let agent = self.agents.resolve(&options).await?;
        let agent: Arc<dyn Agent> = match &self.ralph {
            Some(ralph_config) => Arc::new(RalphAgent::new(
                agent,
                ralph_config.clone(),
                Some(Arc::new(SessionServiceAppender { session_service: self.session_service.clone() })),
            )),
            None => agent,
        };

        let request_id = options.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if request_id.is_empty() {
            return Err(Error::Config("request id must not be empty".into()));
        }

        let session_was_empty = session.is_empty();
        if session_was_empty {
            if let Some(seed) = &options.messages_seed {
                for seed_message in seed {
                    let author = if seed_message.role == Role::User { "user".to_string() } else { agent.info().name };
                    let event = seed_event(&author, seed_message);
                    self.session_service.append_event(&conversation_key, event).await?;
                }
                TraceEvent::SeedMessagesAppended {
                    request_id: request_id.clone(),
                    count: seed.len(),
                }
                .emit();
                session = self
                    .session_service
                    .get_session(&conversation_key)
                    .await?
                    .ok_or_else(|| Error::Session("session vanished after seeding".into()))?;
            }
        }

        if let Some(msg) = &message {
            if !msg.text.is_empty() {
                let duplicate = session
                    .last_user_event()
                    .is_some_and(|last| last.response.as_ref().is_some_and(|r| r.choices.iter().any(|c| c.role == Some(Role::User) && c.extract_text() == msg.text)));
                if !duplicate {
                    let event = seed_event("user", msg);
                    self.session_service.append_event(&conversation_key, event).await?;
                }
                TraceEvent::UserMessageAppended {
                    request_id: request_id.clone(),
                    deduplicated: duplicate,
                }
                .emit();
            }
        }

        let max_run_duration = options.max_run_duration.or_else(|| self.config.default_max_run_duration_ms.map(std::time::Duration::from_millis));
        let deadline = min_deadline(caller_deadline, max_run_duration.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())));
        let child_cancel = if options.detached_cancel { CancelToken::new() } else { caller_cancel.clone() };
        let ctx = ExecContext::new(child_cancel.clone(), deadline);

        let invocation_id = Uuid::new_v4().to_string();
        self.registry.register(&request_id, &invocation_id, &agent.info().name, &conversation_key.as_key(), child_cancel.clone())?;

        let options = Arc::new(options);
        let invocation = Arc::new(Invocation::new(invocation_id.clone(), request_id.clone(), agent.clone(), conversation_key.clone(), message, options.clone()));

        TraceEvent::RunStarted {
            request_id: request_id.clone(),
            invocation_id: invocation_id.clone(),
            agent_name: agent.info().name,
        }
        .emit();

        let dispatch = agent.run(ctx.clone(), invocation.clone()).await;
        let agent_stream = match dispatch {
            Ok(stream) => stream,
            Err(e) => {
                let error_event = build_dispatch_error_event(&invocation, &e);
                let _ = self.session_service.append_event(&conversation_key, error_event).await;
                self.registry.unregister(&request_id);
                child_cancel.cancel();
                invocation.completion_notices.clear();
                return Err(Error::AgentDispatch(e.to_string()));
            }
        };

        let mut all_plugins = self.plugins.clone();
        all_plugins.extend(options.plugins.iter().cloned());

        let deps = EventLoopDeps {
            session_service: self.session_service.clone(),
            memory_service: self.memory_service.clone(),
            plugin_manager: Arc::new(PluginManager::new(all_plugins)),
            registry: self.registry.clone(),
            graph_emit_final_model_responses: options.graph_emit_final_model_responses,
        };

        let (stream, _flush_handle) = event_loop::spawn(invocation, agent_stream, ctx, deps);
        Ok(stream)
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        let found = self.registry.cancel(request_id);
        TraceEvent::RunCancelled {
            request_id: request_id.to_string(),
            found,
        }
        .emit();
        found
    }

    pub fn run_status(&self, request_id: &str) -> Option<RunStatusSnapshot> {
        self.registry.lookup(request_id).map(|h| h.snapshot())
    }

    /// Idempotent: cancels all live runs, closes owned services only.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.registry.cancel_all();
        if self.owns_session_service {
            self.session_service.close().await?;
        }
        if let Some(memory) = &self.memory_service {
            if self.owns_memory_service {
                memory.close().await?;
            }
        }
        Ok(())
    }
}

fn seed_event(author: &str, message: &SeedMessage) -> Event {
    let mut event = Event::new(Uuid::new_v4().to_string(), "", "", author);
    event.filter_key = Some(runner_domain::event::DEFAULT_FILTER_KEY.to_string());
    event.response = Some(Response {
        id: Uuid::new_v4().to_string(),
        object: EventObject::ChatCompletion,
        choices: vec![Choice::text(message.role, message.text.clone())],
        done: false,
        is_partial: false,
    });
    event
}

fn build_dispatch_error_event(invocation: &Invocation, err: &Error) -> Event {
    let mut event = Event::new(Uuid::new_v4().to_string(), invocation.invocation_id.clone(), invocation.request_id.clone(), invocation.agent.info().name);
    event.filter_key = Some(runner_domain::event::DEFAULT_FILTER_KEY.to_string());
    event.error = Some(runner_domain::event::EventError {
        error_type: "agent-dispatch-error".to_string(),
        message: err.to_string(),
    });
    crate::session_adapter::apply_error_content_invariant(event)
}

fn min_deadline(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Also usable as an agent factory placeholder that's never invoked.
pub struct NoopAgentFactory;

#[async_trait]
impl AgentFactory for NoopAgentFactory {
    async fn build(&self, name: &str) -> Result<Arc<dyn Agent>> {
        Err(Error::AgentNotFound(name.to_string()))
    }
}
