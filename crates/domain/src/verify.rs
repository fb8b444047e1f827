use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;

/// Parameters for a single verify-command invocation.
#[derive(Debug, Clone)]
pub struct VerifySpec {
    pub command: String,
    pub work_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
}

/// Outcome of a verify-command invocation.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl VerifyOutcome {
    /// Passes iff exit code is 0 AND not timed out.
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Render the standard verify-command failure message embedded in the
    /// Ralph Loop's feedback message for the next iteration.
    pub fn failure_message(&self, command: &str) -> String {
        let timed_out_suffix = if self.timed_out { " (timed out)" } else { "" };
        format!(
            "Verify command failed:\n{command}\nExit code: {:?}{timed_out_suffix}\n\nStdout:\n{}\n\nStderr:\n{}",
            self.exit_code, self.stdout, self.stderr
        )
    }
}

/// The Ralph Loop's shell-verifier contract. The default implementation
/// runs `bash -lc <command>`; callers may substitute their own runner
/// (e.g. to sandbox execution).
#[async_trait]
pub trait VerifyRunner: Send + Sync {
    async fn run(&self, spec: &VerifySpec) -> Result<VerifyOutcome>;
}

/// Outcome of a single custom verifier.
#[derive(Debug, Clone)]
pub struct VerifierOutcome {
    pub passed: bool,
    pub message: Option<String>,
}

/// A custom Ralph Loop stop condition beyond promise/command checks.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, last_full_event: &Event) -> Result<VerifierOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passed_requires_zero_exit_and_no_timeout() {
        let ok = VerifyOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            timed_out: false,
        };
        assert!(ok.passed());

        let bad_exit = VerifyOutcome {
            exit_code: Some(1),
            ..ok.clone_for_test()
        };
        assert!(!bad_exit.passed());

        let timed_out = VerifyOutcome {
            timed_out: true,
            ..ok.clone_for_test()
        };
        assert!(!timed_out.passed());
    }

    #[test]
    fn failure_message_includes_command_and_streams() {
        let outcome = VerifyOutcome {
            stdout: "built ok".into(),
            stderr: "warning: x".into(),
            exit_code: Some(1),
            timed_out: false,
        };
        let msg = outcome.failure_message("cargo test");
        assert!(msg.contains("cargo test"));
        assert!(msg.contains("built ok"));
        assert!(msg.contains("warning: x"));
        assert!(msg.contains("Exit code: Some(1)"));
    }

    impl VerifyOutcome {
        fn clone_for_test(&self) -> Self {
            VerifyOutcome {
                stdout: self.stdout.clone(),
                stderr: self.stderr.clone(),
                exit_code: self.exit_code,
                timed_out: self.timed_out,
            }
        }
    }
}
