// Execution Results
// Status enums and result records for steps, job instances, and runs

use crate::execution::matrix::MatrixInstance;
use crate::workflow::models::Step;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Terminal state of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Value exposed as `steps.<id>.outcome`
    pub fn outcome(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "success",
            StepStatus::Failed => "failure",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Terminal state of a job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl InstanceStatus {
    /// Skipped instances do not fail the run
    pub fn is_success(&self) -> bool {
        !matches!(self, InstanceStatus::Failed)
    }
}

/// Terminal state of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// The event did not match the workflow's triggers; nothing ran
    NotTriggered,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, RunStatus::Failed)
    }
}

/// Category of the failure that ended a job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Acquiring the environment, checking out, or setting up a toolchain
    Provisioning,
    /// Installing packages or tooling
    Installation,
    /// Static checks and linters
    Check,
    /// The test target
    Test,
    /// Uploading the coverage report
    CoverageUpload,
    /// Any other command
    Command,
}

impl FailureKind {
    /// Classify a failed step by the action it uses, or by its name and script.
    pub fn for_step(step: &Step, script: Option<&str>) -> Self {
        if let Some(uses) = &step.uses {
            let action = uses.split('@').next().unwrap_or(uses).to_lowercase();
            return if action.ends_with("/checkout") || action.contains("/setup-") {
                FailureKind::Provisioning
            } else if action.contains("codecov") || action.contains("coverage") {
                FailureKind::CoverageUpload
            } else {
                FailureKind::Command
            };
        }

        let from_name = step.name.as_deref().map(Self::classify_text);
        match (from_name, script) {
            (Some(kind), _) if kind != FailureKind::Command => kind,
            (_, Some(script)) => Self::classify_text(script),
            _ => FailureKind::Command,
        }
    }

    fn classify_text(text: &str) -> Self {
        let text = text.to_lowercase();
        if text.contains("install") {
            FailureKind::Installation
        } else if text.contains("check") || text.contains("lint") {
            FailureKind::Check
        } else if text.contains("test") {
            FailureKind::Test
        } else {
            FailureKind::Command
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Provisioning => "environment provisioning",
            FailureKind::Installation => "dependency installation",
            FailureKind::Check => "check",
            FailureKind::Test => "test",
            FailureKind::CoverageUpload => "coverage upload",
            FailureKind::Command => "command",
        };
        f.write_str(label)
    }
}

/// Result of a single step
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Position of the step in the job
    pub index: usize,
    /// Display name (interpolated)
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Why the step failed or was skipped
    pub error: Option<String>,
    /// Values written to `GITHUB_OUTPUT` or set by a local action
    pub outputs: HashMap<String, String>,
}

impl StepResult {
    pub(crate) fn skipped(index: usize, name: String, reason: impl Into<String>) -> Self {
        Self {
            index,
            name,
            status: StepStatus::Skipped,
            exit_code: None,
            duration: Duration::ZERO,
            error: Some(reason.into()),
            outputs: HashMap::new(),
        }
    }
}

/// Result of one job instance
#[derive(Debug, Clone)]
pub struct InstanceResult {
    pub job_id: String,
    /// Label such as `build (3.8, 2.0.0)`
    pub instance: String,
    /// Matrix values the instance ran with
    pub matrix: MatrixInstance,
    pub status: InstanceStatus,
    pub steps: Vec<StepResult>,
    /// Set when `status` is `Failed`
    pub failure: Option<FailureKind>,
    pub duration: Duration,
    /// Environment directory left on disk when environments are kept
    pub kept_environment: Option<std::path::PathBuf>,
}

impl InstanceResult {
    /// The step that ended the instance, if any
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}

/// Result of a whole run
#[derive(Debug, Clone)]
pub struct RunResult {
    pub workflow_name: String,
    pub status: RunStatus,
    /// Instances in job id order, then matrix order
    pub instances: Vec<InstanceResult>,
    pub duration: Duration,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.status.is_success()
    }

    pub fn failed_instances(&self) -> impl Iterator<Item = &InstanceResult> {
        self.instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Failed)
    }

    /// Aggregate status: the run succeeds iff no instance failed.
    pub(crate) fn aggregate(instances: &[InstanceResult]) -> RunStatus {
        if instances.iter().all(|i| i.status.is_success()) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }
}

/// A job as it would be scheduled for an event
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub job_id: String,
    pub instances: Vec<MatrixInstance>,
    /// The job's `max-parallel`, if set
    pub max_parallel: Option<usize>,
    pub step_names: Vec<String>,
}

/// What `execute` would do for an event, without running anything
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub workflow_name: String,
    pub event_name: String,
    pub git_ref: String,
    pub triggered: bool,
    /// Empty when not triggered
    pub jobs: Vec<PlannedJob>,
    /// Process-wide concurrency limit
    pub max_parallel: usize,
}

impl RunPlan {
    pub fn total_instances(&self) -> usize {
        self.jobs.iter().map(|j| j.instances.len()).sum()
    }
}
