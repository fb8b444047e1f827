//! Ralph Loop Wrapper: an `Agent` that composes an inner agent and
//! repeats it until a configured stop condition passes or the iteration
//! cap is hit.

pub mod verify;

use std::sync::Arc;

use async_trait::async_trait;
use async_stream::stream;
use futures_util::StreamExt;

use runner_domain::agent::{Agent, AgentInfo};
use runner_domain::cancel::ExecContext;
use runner_domain::content::{Choice, Role, ToolDefinition};
use runner_domain::error::{Error, Result};
use runner_domain::event::{Event, EventError, EventObject, Response};
use runner_domain::invocation::{ConversationKey, Invocation, RunOptions};
use runner_domain::run::RalphLoopConfig;
use runner_domain::stream::BoxStream;
use runner_domain::verify::VerifySpec;

/// Appends a feedback message as a user-authored event to the session
/// backing an invocation. Attached separately from `Invocation` because
/// only the Ralph wrapper, not every agent, needs write access to it.
#[async_trait]
pub trait SessionAppender: Send + Sync {
    async fn append_user_event(&self, conversation_key: &ConversationKey, text: String) -> Result<()>;
}

pub struct RalphAgent {
    inner: Arc<dyn Agent>,
    config: RalphLoopConfig,
    appender: Option<Arc<dyn SessionAppender>>,
}

impl RalphAgent {
    pub fn new(inner: Arc<dyn Agent>, config: RalphLoopConfig, appender: Option<Arc<dyn SessionAppender>>) -> Self {
        Self { inner, config, appender }
    }
}

fn error_event(invocation_id: &str, request_id: &str, author: &str, error_type: &str, message: String) -> Event {
    let mut event = Event::new(format!("{request_id}-ralph-error"), invocation_id, request_id, author);
    event.error = Some(EventError {
        error_type: error_type.to_string(),
        message: message.clone(),
    });
    let mut choice = Choice::text(Role::Assistant, message);
    choice.finish_reason = Some("error".to_string());
    let mut response = Response::new(format!("{request_id}-ralph-error"), EventObject::Error);
    response.choices = vec![choice];
    event.response = Some(response);
    event
}

/// Extract assistant text from the last non-partial event, if any.
fn assistant_text(event: &Event) -> Option<String> {
    let response = event.response.as_ref()?;
    response
        .choices
        .iter()
        .find(|c| c.role == Some(Role::Assistant))
        .map(Choice::extract_text)
}

/// Scan `text` for the first substring enclosed by the configured
/// promise tags, whitespace-normalize it, and compare against the
/// configured promise (also whitespace-normalized).
fn promise_satisfied(config: &RalphLoopConfig, text: &str) -> bool {
    let Some(promise) = &config.completion_promise else {
        return true;
    };
    let Some(start) = text.find(config.promise_tag_open.as_str()) else {
        return false;
    };
    let content_start = start + config.promise_tag_open.len();
    let Some(end_offset) = text[content_start..].find(config.promise_tag_close.as_str()) else {
        return false;
    };
    let found = &text[content_start..content_start + end_offset];
    normalize_whitespace(found) == normalize_whitespace(promise)
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct VerifyIterationOutcome {
    passed: bool,
    failure_report: Option<String>,
}

async fn verify_iteration(config: &RalphLoopConfig, last_full: Option<&Event>) -> Result<VerifyIterationOutcome> {
    let text = last_full.and_then(assistant_text).unwrap_or_default();

    let promise_ok = promise_satisfied(config, &text);

    let mut command_report = None;
    let command_ok = match (&config.verify_command, &config.verify_runner) {
        (Some(command), Some(runner)) => {
            let spec = VerifySpec {
                command: command.clone(),
                work_dir: config.verify_work_dir.clone(),
                timeout: config.verify_timeout,
                env: config.verify_env.clone(),
            };
            let outcome = runner.run(&spec).await?;
            if !outcome.passed() {
                command_report = Some(outcome.failure_message(command));
            }
            outcome.passed()
        }
        (Some(_), None) => return Err(Error::Config("verify_command configured without a verify_runner".into())),
        (None, _) => true,
    };

    let mut verifier_reports = Vec::new();
    let mut verifiers_ok = true;
    for verifier in &config.verifiers {
        let outcome = verifier.verify(last_full.unwrap_or(&Event::new("", "", "", ""))).await?;
        if !outcome.passed {
            verifiers_ok = false;
            if let Some(message) = outcome.message {
                verifier_reports.push(message);
            }
        }
    }

    let passed = promise_ok && command_ok && verifiers_ok;
    if passed {
        return Ok(VerifyIterationOutcome { passed: true, failure_report: None });
    }

    let mut parts = Vec::new();
    if !verifier_reports.is_empty() {
        parts.push(verifier_reports.join("\n"));
    }
    if let Some(report) = command_report {
        parts.push(report);
    }
    if !promise_ok && config.completion_promise.is_some() {
        parts.push(format!(
            "Expected completion promise \"{}\" was not found in the last response.",
            config.completion_promise.as_deref().unwrap_or_default()
        ));
    }

    Ok(VerifyIterationOutcome {
        passed: false,
        failure_report: Some(parts.join("\n\n")),
    })
}

#[async_trait]
impl Agent for RalphAgent {
    fn info(&self) -> AgentInfo {
        self.inner.info()
    }

    fn sub_agents(&self) -> Vec<Arc<dyn Agent>> {
        vec![self.inner.clone()]
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        self.inner.tools()
    }

    async fn run(&self, ctx: ExecContext, invocation: Arc<Invocation>) -> Result<BoxStream<'static, Event>> {
        self.config.validate()?;

        let inner = self.inner.clone();
        let config = self.config.clone();
        let appender = self.appender.clone();
        let invocation_id = invocation.invocation_id.clone();
        let request_id = invocation.request_id.clone();
        let agent_name = inner.info().name;
        let conversation_key = invocation.conversation_key.clone();
        let options = invocation.options.clone();

        let owned_stream = stream! {
            let mut last_full: Option<Event> = None;

            for iteration in 1..=config.max_iterations {
                if ctx.is_cancelled() {
                    return;
                }

                tracing::info!(request_id = %request_id, iteration, "ralph loop iteration started");

                let child_invocation = Arc::new(Invocation::new(
                    format!("{invocation_id}-iter-{iteration}"),
                    request_id.clone(),
                    inner.clone(),
                    conversation_key.clone(),
                    None,
                    options.clone(),
                ));

                let dispatch = inner.run(ctx.clone(), child_invocation).await;
                let mut inner_stream = match dispatch {
                    Ok(s) => s,
                    Err(e) => {
                        yield error_event(&invocation_id, &request_id, &agent_name, "stop-agent-error", format!("ralph loop dispatch failed: {e}"));
                        return;
                    }
                };

                while let Some(event) = inner_stream.next().await {
                    if !event.is_partial() {
                        last_full = Some(event.clone());
                    }
                    yield event;
                }

                let outcome = match verify_iteration(&config, last_full.as_ref()).await {
                    Ok(o) => o,
                    Err(e) => {
                        yield error_event(&invocation_id, &request_id, &agent_name, "stop-agent-error", format!("ralph loop verifier error: {e}"));
                        return;
                    }
                };

                if outcome.passed {
                    tracing::info!(request_id = %request_id, iteration, "ralph loop iteration passed");
                    return;
                }

                tracing::info!(request_id = %request_id, iteration, "ralph loop iteration failed, appending feedback");

                let feedback = outcome.failure_report.unwrap_or_else(|| "verification failed".to_string());
                match &appender {
                    Some(appender) => {
                        if let Err(e) = appender.append_user_event(&conversation_key, feedback).await {
                            yield error_event(&invocation_id, &request_id, &agent_name, "stop-agent-error", format!("failed to append ralph feedback: {e}"));
                            return;
                        }
                    }
                    None => {
                        yield error_event(&invocation_id, &request_id, &agent_name, "stop-agent-error", "ralph loop has no session appender to record feedback".to_string());
                        return;
                    }
                }
            }

            yield error_event(&invocation_id, &request_id, &agent_name, "stop-agent-error", format!("ralph loop exceeded max_iterations ({})", config.max_iterations));
        };

        Ok(Box::pin(owned_stream))
    }
}
