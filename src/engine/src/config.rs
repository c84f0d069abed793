//! Engine configuration
//!
//! Defaults suit an in-process engine; [`EngineConfig::from_env`] lets a
//! deployment override them without code changes.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// How the registry turns compile requests into compiled values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    /// The registry calls the compiler synchronously while dispatching
    #[default]
    Inline,
    /// Compile requests are queued for an asynchronous driver
    Deferred,
}

impl FromStr for CompileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "deferred" => Ok(Self::Deferred),
            other => Err(format!("unknown compile mode '{}'", other)),
        }
    }
}

/// Time budgets for sandboxed rule code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Budget for compiling one user-defined rule body
    pub compile_budget_ms: u64,

    /// Budget for a single rule evaluation
    pub eval_budget_ms: u64,
}

impl SandboxConfig {
    pub fn compile_budget(&self) -> Duration {
        Duration::from_millis(self.compile_budget_ms)
    }

    pub fn eval_budget(&self) -> Duration {
        Duration::from_millis(self.eval_budget_ms)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            compile_budget_ms: 100,
            eval_budget_ms: 100,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inline or deferred compilation
    pub compile_mode: CompileMode,

    /// Sandbox budgets for user-defined rules
    pub sandbox: SandboxConfig,
}

impl EngineConfig {
    /// Defaults overlaid with `PERMIT_*` environment variables
    ///
    /// - `PERMIT_COMPILE_MODE` - `inline` or `deferred`
    /// - `PERMIT_RULE_COMPILE_BUDGET_MS` - rule compile budget
    /// - `PERMIT_RULE_EVAL_BUDGET_MS` - rule evaluation budget
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(mode) = env_parse::<CompileMode>("PERMIT_COMPILE_MODE") {
            config.compile_mode = mode;
        }
        if let Some(ms) = env_parse::<u64>("PERMIT_RULE_COMPILE_BUDGET_MS") {
            config.sandbox.compile_budget_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("PERMIT_RULE_EVAL_BUDGET_MS") {
            config.sandbox.eval_budget_ms = ms;
        }

        config
    }

    pub fn with_compile_mode(mut self, mode: CompileMode) -> Self {
        self.compile_mode = mode;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
