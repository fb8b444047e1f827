use serde::{Deserialize, Serialize};

/// Ambient Ralph Loop defaults, overridable per-run via `RalphLoopConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphDefaultsConfig {
    pub max_iterations: u32,
    pub promise_tag_open: String,
    pub promise_tag_close: String,
}

impl Default for RalphDefaultsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            promise_tag_open: "<promise>".to_string(),
            promise_tag_close: "</promise>".to_string(),
        }
    }
}

/// Top-level runner configuration, loaded from TOML at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    pub ralph: RalphDefaultsConfig,
    pub default_max_run_duration_ms: Option<u64>,
}

/// Severity of a configuration validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl RunnerConfig {
    /// Collects validation issues without failing fast, mirroring how the
    /// rest of the ambient config surface reports problems.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.ralph.max_iterations == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "ralph.max_iterations must be greater than zero".to_string(),
            });
        }
        if let Some(ms) = self.default_max_run_duration_ms {
            if ms == 0 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: "default_max_run_duration_ms is zero; runs will have no default deadline".to_string(),
                });
            }
        }
        issues
    }

    pub fn has_errors(&self) -> bool {
        self.validate().iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}
