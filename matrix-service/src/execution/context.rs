// Runtime Execution Context
// Per-instance state: expression contexts and the process environment of each step

use crate::execution::environment::{CommandFiles, IsolatedEnvironment};
use crate::execution::matrix::MatrixInstance;
use crate::execution::results::{StepResult, StepStatus};
use crate::expression::{ExpressionContext, ExpressionEngine};
use crate::trigger::TriggerEvent;
use crate::workflow::models::{Job, Step, Workflow};
use crate::ServiceResult;

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Host variables a step inherits; everything else is cleared
pub const INHERITED_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "SHELL", "TMPDIR",
];

const PATH_SEPARATOR: &str = if cfg!(windows) { ";" } else { ":" };

/// `RUNNER_OS` value for the host
pub fn runner_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        other => other,
    }
}

/// `RUNNER_ARCH` value for the host
pub fn runner_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "X64",
        "x86" => "X86",
        "aarch64" => "ARM64",
        "arm" => "ARM",
        other => other,
    }
}

/// Runtime context of one job instance
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    /// Values visible to `${{ }}` expressions
    pub expressions: ExpressionContext,

    /// Workflow and job env, plus everything steps appended to `GITHUB_ENV`
    pub env: BTreeMap<String, String>,

    /// Directories from `GITHUB_PATH`, most recent first
    pub path_prepend: Vec<String>,

    /// `CI`, `GITHUB_*` and `RUNNER_*` variables
    runner_vars: BTreeMap<String, String>,
}

impl RuntimeContext {
    /// Build the context for one instance of `job` running in `environment`.
    pub fn new(
        workflow: &Workflow,
        job_id: &str,
        job: &Job,
        instance: &MatrixInstance,
        event: &TriggerEvent,
        environment: &IsolatedEnvironment,
    ) -> ServiceResult<Self> {
        let path = |p: std::path::PathBuf| p.to_string_lossy().into_owned();
        let workspace = path(environment.workspace());

        let mut runner_vars = BTreeMap::new();
        let mut set = |name: &str, value: String| {
            runner_vars.insert(name.to_string(), value);
        };
        set("CI", "true".into());
        set("GITHUB_ACTIONS", "true".into());
        set("GITHUB_WORKSPACE", workspace.clone());
        set("GITHUB_ENV", path(environment.env_file()));
        set("GITHUB_PATH", path(environment.path_file()));
        set("GITHUB_OUTPUT", path(environment.output_file()));
        set("GITHUB_EVENT_NAME", event.name().into());
        set("GITHUB_REF", event.git_ref());
        set("GITHUB_REF_NAME", event.ref_name());
        set("GITHUB_BASE_REF", event.base_ref().unwrap_or_default().into());
        set("GITHUB_JOB", job_id.into());
        set("GITHUB_WORKFLOW", workflow.name.clone().unwrap_or_default());
        set("RUNNER_OS", runner_os().into());
        set("RUNNER_ARCH", runner_arch().into());
        set("RUNNER_TEMP", path(environment.temp_dir()));
        set("RUNNER_TOOL_CACHE", path(environment.tool_dir()));

        let mut expressions = ExpressionContext::new().with_matrix(
            instance.values.iter().map(|(name, value)| (name, value)),
        );
        expressions.set_github("event_name", event.name());
        expressions.set_github("ref", event.git_ref());
        expressions.set_github("ref_name", event.ref_name());
        expressions.set_github("base_ref", event.base_ref().unwrap_or_default());
        expressions.set_github("workspace", workspace);
        expressions.set_github("job", job_id);
        expressions.set_github("workflow", workflow.name.clone().unwrap_or_default());
        if let TriggerEvent::PullRequest {
            head_branch: Some(head),
            ..
        } = event
        {
            expressions.set_github("head_ref", head.as_str());
        }
        expressions.set_runner("os", runner_os());
        expressions.set_runner("arch", runner_arch());
        expressions.set_runner("temp", path(environment.temp_dir()));
        expressions.set_runner("tool_cache", path(environment.tool_dir()));
        expressions
            .job
            .insert("status".into(), Value::from("success"));

        let mut ctx = Self {
            expressions,
            env: BTreeMap::new(),
            path_prepend: Vec::new(),
            runner_vars,
        };

        // Later levels see earlier ones through `env.*`
        for (name, value) in workflow.env.iter().chain(job.env.iter()) {
            let value = ExpressionEngine::interpolate(value, &ctx.expressions)?;
            ctx.set_env(name.clone(), value);
        }

        Ok(ctx)
    }

    fn set_env(&mut self, name: String, value: String) {
        self.expressions.set_env(name.clone(), value.clone());
        self.env.insert(name, value);
    }

    /// Expression context for `step` (with its `env` visible) and its interpolated env.
    pub fn step_scope(
        &self,
        step: &Step,
    ) -> ServiceResult<(ExpressionContext, BTreeMap<String, String>)> {
        let mut expressions = self.expressions.clone();
        let mut step_env = BTreeMap::new();
        for (name, value) in &step.env {
            let value = ExpressionEngine::interpolate(value, &expressions)?;
            expressions.set_env(name.clone(), value.clone());
            step_env.insert(name.clone(), value);
        }
        Ok((expressions, step_env))
    }

    /// Complete process environment for a step: inherited host variables,
    /// runner variables, accumulated env, then the step's own env.
    pub fn process_env(&self, step_env: &BTreeMap<String, String>) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = INHERITED_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect();

        vars.extend(self.runner_vars.clone());
        vars.extend(self.env.clone());
        vars.extend(step_env.clone());

        if !self.path_prepend.is_empty() {
            let mut entries = self.path_prepend.clone();
            if let Some(existing) = vars.get("PATH").filter(|p| !p.is_empty()) {
                entries.push(existing.clone());
            }
            vars.insert("PATH".into(), entries.join(PATH_SEPARATOR));
        }

        vars
    }

    /// Fold a step's `GITHUB_ENV` and `GITHUB_PATH` writes into the context.
    pub fn apply_command_files(&mut self, files: &CommandFiles) {
        for (name, value) in &files.env {
            self.set_env(name.clone(), value.clone());
        }
        for dir in &files.path {
            self.path_prepend.insert(0, dir.clone());
        }
    }

    /// Record a finished step so later steps can read `steps.<id>.*` and `job.status`.
    pub fn record_step(&mut self, step: &Step, result: &StepResult) {
        if let Some(id) = &step.id {
            self.expressions.record_step(
                id.clone(),
                result.outputs.clone(),
                result.status.outcome(),
            );
        }
        if result.status == StepStatus::Failed {
            self.expressions.failed = true;
            self.expressions
                .job
                .insert("status".into(), Value::from("failure"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::MatrixExpander;
    use crate::WorkflowParser;
    use std::time::Duration;

    const WORKFLOW: &str = r#"
name: ctx
on: push
env:
  LEVEL: workflow
  PY: ${{ matrix.python }}
jobs:
  build:
    env:
      LEVEL: job
      COMBO: ${{ env.PY }}-${{ matrix.torch }}
    strategy:
      matrix:
        python: [3.8]
        torch: [2.0.0]
    steps:
      - id: setup
        run: echo hi
        env:
          LEVEL: step
          REF: ${{ github.ref_name }}
"#;

    fn context(env: &IsolatedEnvironment) -> (Workflow, RuntimeContext) {
        let workflow = WorkflowParser::parse(WORKFLOW).unwrap();
        let job = &workflow.jobs["build"];
        let instance = MatrixExpander::expand_strategy(job.strategy.as_ref()).unwrap()[0].clone();
        let event = TriggerEvent::push_branch("master");
        let ctx = RuntimeContext::new(&workflow, "build", job, &instance, &event, env).unwrap();
        (workflow, ctx)
    }

    #[test]
    fn test_env_layering() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let (workflow, ctx) = context(&env);

        assert_eq!(ctx.env["LEVEL"], "job");
        assert_eq!(ctx.env["PY"], "3.8");
        assert_eq!(ctx.env["COMBO"], "3.8-2.0.0");

        let step = &workflow.jobs["build"].steps[0];
        let (_, step_env) = ctx.step_scope(step).unwrap();
        let vars = ctx.process_env(&step_env);
        assert_eq!(vars["LEVEL"], "step");
        assert_eq!(vars["REF"], "master");
        assert_eq!(vars["CI"], "true");
        assert_eq!(vars["GITHUB_EVENT_NAME"], "push");
        assert_eq!(vars["GITHUB_REF"], "refs/heads/master");
        assert_eq!(
            vars["GITHUB_WORKSPACE"],
            env.workspace().to_string_lossy()
        );
        assert_eq!(vars["GITHUB_ENV"], env.env_file().to_string_lossy());
    }

    #[test]
    fn test_host_environment_is_filtered() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let (_, ctx) = context(&env);

        let vars = ctx.process_env(&BTreeMap::new());
        for name in vars.keys() {
            let allowed = INHERITED_VARS.contains(&name.as_str())
                || name.starts_with("GITHUB_")
                || name.starts_with("RUNNER_")
                || name == "CI"
                || ctx.env.contains_key(name);
            assert!(allowed, "unexpected variable {}", name);
        }
    }

    #[test]
    fn test_command_files_update_env_and_path() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let (_, mut ctx) = context(&env);

        ctx.apply_command_files(&CommandFiles {
            env: vec![("pythonLocation".into(), "/opt/py".into())],
            path: vec!["/opt/a".into(), "/opt/b".into()],
            outputs: Vec::new(),
        });

        assert_eq!(ctx.env["pythonLocation"], "/opt/py");
        assert_eq!(
            ctx.expressions.env.get("pythonLocation"),
            Some(&Value::from("/opt/py"))
        );
        let path = ctx.process_env(&BTreeMap::new())["PATH"].clone();
        assert!(path.starts_with(&format!("/opt/b{}/opt/a", PATH_SEPARATOR)));
    }

    #[test]
    fn test_record_step_outputs_and_failure() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let (workflow, mut ctx) = context(&env);
        let step = &workflow.jobs["build"].steps[0];

        let mut result = StepResult::skipped(0, "setup".into(), "");
        result.status = StepStatus::Failed;
        result.duration = Duration::from_millis(5);
        result.outputs.insert("version".into(), "3.8.18".into());
        ctx.record_step(step, &result);

        assert!(ctx.expressions.failed);
        assert_eq!(
            ExpressionEngine::interpolate("${{ steps.setup.outputs.version }}", &ctx.expressions)
                .unwrap(),
            "3.8.18"
        );
        assert_eq!(
            ExpressionEngine::interpolate("${{ job.status }}", &ctx.expressions).unwrap(),
            "failure"
        );
    }
}
