//! Default shell-based `VerifyRunner`: `bash -lc <command>`, merged
//! environment, working directory, and a timeout applied via the context
//! deadline.

use async_trait::async_trait;
use tokio::process::Command;

use runner_domain::error::Result;
use runner_domain::verify::{VerifyOutcome, VerifyRunner, VerifySpec};

pub struct DefaultVerifyRunner;

#[async_trait]
impl VerifyRunner for DefaultVerifyRunner {
    async fn run(&self, spec: &VerifySpec) -> Result<VerifyOutcome> {
        let mut cmd = Command::new("bash");
        cmd.arg("-lc").arg(&spec.command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }
        // Command inherits the full process environment by default;
        // overlaying `spec.env` on top means overrides win.
        cmd.envs(spec.env.clone());

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return Ok(VerifyOutcome {
                    stdout: String::new(),
                    stderr: format!("failed to spawn verify command: {e}"),
                    exit_code: None,
                    timed_out: false,
                });
            }
        };

        let wait = child.wait_with_output();
        match spec.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(Ok(output)) => Ok(VerifyOutcome {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code(),
                    timed_out: false,
                }),
                Ok(Err(e)) => Ok(VerifyOutcome {
                    stdout: String::new(),
                    stderr: format!("verify command wait failed: {e}"),
                    exit_code: None,
                    timed_out: false,
                }),
                Err(_elapsed) => Ok(VerifyOutcome {
                    stdout: String::new(),
                    stderr: "verify command timed out".to_string(),
                    exit_code: None,
                    timed_out: true,
                }),
            },
            None => match wait.await {
                Ok(output) => Ok(VerifyOutcome {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code(),
                    timed_out: false,
                }),
                Err(e) => Ok(VerifyOutcome {
                    stdout: String::new(),
                    stderr: format!("verify command wait failed: {e}"),
                    exit_code: None,
                    timed_out: false,
                }),
            },
        }
    }
}
