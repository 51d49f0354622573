// Runners Module
// Provides step execution runners for `run` scripts and local `uses` actions

pub mod actions;
pub mod shell;

// Re-export key types
pub use actions::{ActionInputs, ActionRegistry, LocalAction};
pub use shell::{Shell, ShellOutput, ShellRunner};

use crate::execution::environment::IsolatedEnvironment;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Callback for handling output lines in real-time; the flag marks stderr
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Everything a runner needs to execute one step of an instance
#[derive(Clone)]
pub struct StepInvocation<'a> {
    /// Position of the step in the job
    pub index: usize,
    /// Process environment, already layered and filtered
    pub env: HashMap<String, String>,
    /// Directory the step runs in
    pub working_dir: PathBuf,
    /// The instance's isolated environment
    pub environment: &'a IsolatedEnvironment,
    /// Kill the step after this long
    pub timeout: Option<Duration>,
    pub on_output: OutputCallback,
}

impl<'a> StepInvocation<'a> {
    /// Invocation that discards output, running in the environment's workspace
    pub fn new(index: usize, environment: &'a IsolatedEnvironment) -> Self {
        Self {
            index,
            env: HashMap::new(),
            working_dir: environment.workspace(),
            environment,
            timeout: None,
            on_output: Arc::new(|_: &str, _: bool| {}),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output(mut self, on_output: OutputCallback) -> Self {
        self.on_output = on_output;
        self
    }

    /// Forward a line to the output callback
    pub fn emit(&self, line: &str, is_error: bool) {
        (self.on_output)(line, is_error);
    }
}

/// How a step ended
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub exit_code: Option<i32>,
    /// Set when the step failed
    pub error: Option<String>,
    /// Non-fatal problems worth surfacing
    pub warnings: Vec<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
