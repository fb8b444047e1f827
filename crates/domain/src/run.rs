use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::verify::{VerifyRunner, Verifier};

/// A point-in-time view of a live run, returned by `Runner::run_status`.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusSnapshot {
    pub request_id: String,
    pub invocation_id: String,
    pub agent_name: String,
    pub session_key: String,
    pub started_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub event_count: u64,
}

/// Configuration for the Ralph Loop Wrapper. At least one of
/// `completion_promise`, `verify_command`, or `verifiers` must be
/// present, or there is no way the loop could ever stop short of
/// `max_iterations`.
#[derive(Clone)]
pub struct RalphLoopConfig {
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub promise_tag_open: String,
    pub promise_tag_close: String,
    pub verify_command: Option<String>,
    pub verify_work_dir: Option<PathBuf>,
    pub verify_timeout: Option<Duration>,
    pub verify_env: HashMap<String, String>,
    pub verify_runner: Option<Arc<dyn VerifyRunner>>,
    pub verifiers: Vec<Arc<dyn Verifier>>,
}

impl Default for RalphLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            completion_promise: None,
            promise_tag_open: "<promise>".to_string(),
            promise_tag_close: "</promise>".to_string(),
            verify_command: None,
            verify_work_dir: None,
            verify_timeout: None,
            verify_env: HashMap::new(),
            verify_runner: None,
            verifiers: Vec::new(),
        }
    }
}

impl RalphLoopConfig {
    /// Enforces that at least one stop condition other than the
    /// iteration ceiling is configured.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Config("ralph.max_iterations must be greater than zero".into()));
        }
        if self.completion_promise.is_none() && self.verify_command.is_none() && self.verifiers.is_empty() {
            return Err(Error::Config(
                "ralph loop requires at least one of completion_promise, verify_command, or verifiers".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_a_stop_condition() {
        let cfg = RalphLoopConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_with_promise_validates() {
        let cfg = RalphLoopConfig {
            completion_promise: Some("done".into()),
            ..RalphLoopConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_max_iterations_is_rejected_even_with_promise() {
        let cfg = RalphLoopConfig {
            max_iterations: 0,
            completion_promise: Some("done".into()),
            ..RalphLoopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_with_verify_command_validates() {
        let cfg = RalphLoopConfig {
            verify_command: Some("cargo test".into()),
            ..RalphLoopConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
