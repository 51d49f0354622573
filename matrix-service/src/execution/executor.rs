// Workflow Executor
// Runs every matrix instance of a triggered workflow with bounded parallelism

use crate::execution::context::{runner_os, RuntimeContext};
use crate::execution::environment::IsolatedEnvironment;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::{MatrixExpander, MatrixInstance};
use crate::execution::results::{
    FailureKind, InstanceResult, InstanceStatus, PlannedJob, RunPlan, RunResult, RunStatus,
    StepResult, StepStatus,
};
use crate::expression::{ExpressionContext, ExpressionEngine};
use crate::runners::{ActionInputs, ActionRegistry, ShellRunner, StepInvocation, StepOutcome};
use crate::trigger::{TriggerEvent, TriggerMatcher};
use crate::workflow::models::{Job, Step, Workflow};
use crate::{ServiceError, ServiceResult};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Process-wide limit on concurrently running instances
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Step timeout when neither the step nor its job sets `timeout-minutes`
pub const DEFAULT_STEP_TIMEOUT_MINUTES: u64 = 360;

/// Where isolated environments are created unless configured otherwise
pub fn default_env_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("matrix-ci")
        .join("environments")
}

/// Configuration for workflow execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum instances running at once across all jobs
    pub max_parallel: usize,
    /// Repository materialized by `actions/checkout`
    pub repository: PathBuf,
    /// Directory isolated environments are created under
    pub env_root: PathBuf,
    /// Leave environments on disk after instances finish
    pub keep_environments: bool,
    /// Timeout for steps without `timeout-minutes` (None = no timeout)
    pub default_step_timeout: Option<Duration>,
    /// Uploader used by the coverage action instead of `codecov` on PATH
    pub coverage_uploader: Option<PathBuf>,
    /// Only run this job
    pub job: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            repository: PathBuf::from("."),
            env_root: default_env_root(),
            keep_environments: false,
            default_step_timeout: Some(Duration::from_secs(DEFAULT_STEP_TIMEOUT_MINUTES * 60)),
            coverage_uploader: None,
            job: None,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_repository(mut self, repository: impl Into<PathBuf>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_env_root(mut self, env_root: impl Into<PathBuf>) -> Self {
        self.env_root = env_root.into();
        self
    }

    pub fn with_keep_environments(mut self, keep: bool) -> Self {
        self.keep_environments = keep;
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_coverage_uploader(mut self, uploader: Option<PathBuf>) -> Self {
        self.coverage_uploader = uploader;
        self
    }

    pub fn with_job(mut self, job: Option<String>) -> Self {
        self.job = job;
        self
    }
}

/// Workflow executor
pub struct WorkflowExecutor {
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
    actions: ActionRegistry,
}

impl WorkflowExecutor {
    /// Create an executor with the built-in local actions
    pub fn new(config: ExecutorConfig) -> Self {
        let actions =
            ActionRegistry::new(config.repository.clone(), config.coverage_uploader.clone());
        Self {
            config,
            event_tx: None,
            actions,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Replace the local action registry
    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Decide whether `event` triggers `workflow` and expand every job's matrix.
    pub fn plan(&self, workflow: &Workflow, event: &TriggerEvent) -> ServiceResult<RunPlan> {
        let triggered = TriggerMatcher::matches(&workflow.on, event);

        let mut jobs = Vec::new();
        if triggered {
            let selected: Vec<&str> = match &self.config.job {
                Some(job) if workflow.jobs.contains_key(job) => vec![job.as_str()],
                Some(job) => {
                    return Err(ServiceError::invalid_workflow(format!(
                        "job '{}' is not defined (available: {})",
                        job,
                        workflow.job_ids().join(", ")
                    )))
                }
                None => workflow.job_ids(),
            };

            for job_id in selected {
                let job = &workflow.jobs[job_id];
                if job.strategy.as_ref().and_then(|s| s.fail_fast) == Some(true) {
                    warn!(job = job_id, "fail-fast is not supported, instances run to completion");
                }
                jobs.push(PlannedJob {
                    job_id: job_id.to_string(),
                    instances: MatrixExpander::expand_strategy(job.strategy.as_ref())?,
                    max_parallel: MatrixExpander::max_parallel(job.strategy.as_ref()),
                    step_names: job.steps.iter().map(Step::display_name).collect(),
                });
            }
        }

        Ok(RunPlan {
            workflow_name: workflow_name(workflow),
            event_name: event.name().to_string(),
            git_ref: event.git_ref(),
            triggered,
            jobs,
            max_parallel: self.config.max_parallel.max(1),
        })
    }

    /// Execute the workflow for `event`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        event: &TriggerEvent,
    ) -> ServiceResult<RunResult> {
        let start = Instant::now();
        let plan = self.plan(workflow, event)?;

        if !plan.triggered {
            info!(workflow = %plan.workflow_name, event = %plan.event_name, git_ref = %plan.git_ref, "event does not trigger workflow");
            self.event_tx.send_event(ExecutionEvent::RunNotTriggered {
                workflow_name: plan.workflow_name.clone(),
                event_name: plan.event_name.clone(),
                git_ref: plan.git_ref.clone(),
            });
            return Ok(RunResult {
                workflow_name: plan.workflow_name,
                status: RunStatus::NotTriggered,
                instances: Vec::new(),
                duration: start.elapsed(),
            });
        }

        let total = plan.total_instances();
        info!(workflow = %plan.workflow_name, instances = total, max_parallel = plan.max_parallel, "starting run");
        self.event_tx.send_event(ExecutionEvent::run_started(
            &plan.workflow_name,
            total,
            plan.max_parallel,
        ));

        let scope = Arc::new(RunScope {
            config: self.config.clone(),
            event_tx: self.event_tx.clone(),
            actions: self.actions.clone(),
            shell: ShellRunner::new(),
            workflow: workflow.clone(),
            event: event.clone(),
        });
        let global = Arc::new(Semaphore::new(plan.max_parallel));

        let mut order = Vec::with_capacity(total);
        let mut tasks = JoinSet::new();
        for job in &plan.jobs {
            let job_limit = job.max_parallel.map(|n| Arc::new(Semaphore::new(n.max(1))));
            for instance in &job.instances {
                let slot = order.len();
                order.push((job.job_id.clone(), instance.clone()));

                let scope = scope.clone();
                let job_id = job.job_id.clone();
                let instance = instance.clone();
                let job_limit = job_limit.clone();
                let global = global.clone();
                tasks.spawn(async move {
                    let result = scope
                        .run_instance(&job_id, instance, job_limit, global)
                        .await;
                    (slot, result)
                });
            }
        }

        let mut results: Vec<Option<InstanceResult>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => results[slot] = Some(result),
                Err(e) => error!(error = %e, "instance task aborted"),
            }
        }

        let instances: Vec<InstanceResult> = results
            .into_iter()
            .zip(order)
            .map(|(result, (job_id, instance))| {
                result.unwrap_or_else(|| InstanceResult {
                    instance: instance.label(&job_id),
                    job_id,
                    matrix: instance,
                    status: InstanceStatus::Failed,
                    steps: Vec::new(),
                    failure: Some(FailureKind::Command),
                    duration: Duration::ZERO,
                    kept_environment: None,
                })
            })
            .collect();

        let status = RunResult::aggregate(&instances);
        let duration = start.elapsed();
        info!(workflow = %plan.workflow_name, ?status, ?duration, "run finished");
        self.event_tx.send_event(ExecutionEvent::run_completed(
            &plan.workflow_name,
            status,
            duration,
        ));

        Ok(RunResult {
            workflow_name: plan.workflow_name,
            status,
            instances,
            duration,
        })
    }
}

fn workflow_name(workflow: &Workflow) -> String {
    workflow
        .name
        .clone()
        .unwrap_or_else(|| "workflow".to_string())
}

/// State shared by the instance tasks of one run
struct RunScope {
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
    actions: ActionRegistry,
    shell: ShellRunner,
    workflow: Workflow,
    event: TriggerEvent,
}

/// Mutable bookkeeping for one instance while its steps run
struct InstanceRun<'a> {
    job_id: &'a str,
    job: &'a Job,
    label: String,
    environment: &'a IsolatedEnvironment,
    context: RuntimeContext,
}

impl RunScope {
    async fn run_instance(
        &self,
        job_id: &str,
        instance: MatrixInstance,
        job_limit: Option<Arc<Semaphore>>,
        global: Arc<Semaphore>,
    ) -> InstanceResult {
        let job = &self.workflow.jobs[job_id];
        let label = instance.label(job_id);
        let mut result = InstanceResult {
            job_id: job_id.to_string(),
            instance: label.clone(),
            matrix: instance.clone(),
            status: InstanceStatus::Succeeded,
            steps: Vec::new(),
            failure: None,
            duration: Duration::ZERO,
            kept_environment: None,
        };

        if let Some(condition) = &job.if_condition {
            let evaluated = self
                .job_condition_context(job_id, &instance)
                .and_then(|context| ExpressionEngine::evaluate_condition(condition, &context));
            match evaluated {
                Ok(true) => {}
                Ok(false) => {
                    info!(instance = %label, %condition, "job condition is false, skipping");
                    self.event_tx.send_event(ExecutionEvent::InstanceSkipped {
                        job_id: job_id.to_string(),
                        instance: label,
                        reason: format!("condition '{}' evaluated to false", condition),
                    });
                    result.status = InstanceStatus::Skipped;
                    return result;
                }
                Err(e) => {
                    self.event_tx
                        .send_event(ExecutionEvent::error(e.to_string(), Some(label.clone())));
                    return self.finish(result, InstanceStatus::Failed, Some(FailureKind::Command));
                }
            }
        }

        self.event_tx.send_event(ExecutionEvent::InstanceQueued {
            job_id: job_id.to_string(),
            instance: label.clone(),
        });

        // Job permit first so a queued job does not hold a global slot
        let _job_permit = acquire(job_limit).await;
        let _permit = acquire(Some(global)).await;

        let start = Instant::now();
        info!(instance = %label, "instance started");
        self.event_tx.send_event(ExecutionEvent::InstanceStarted {
            job_id: job_id.to_string(),
            instance: label.clone(),
            total_steps: job.steps.len(),
        });

        let environment = match IsolatedEnvironment::provision(&self.config.env_root) {
            Ok(environment) => environment,
            Err(e) => {
                error!(instance = %label, error = %e, "failed to provision environment");
                self.event_tx
                    .send_event(ExecutionEvent::error(e.to_string(), Some(label.clone())));
                result.duration = start.elapsed();
                return self.finish(result, InstanceStatus::Failed, Some(FailureKind::Provisioning));
            }
        };

        let outcome = match RuntimeContext::new(
            &self.workflow,
            job_id,
            job,
            &instance,
            &self.event,
            &environment,
        ) {
            Ok(context) => {
                let mut run = InstanceRun {
                    job_id,
                    job,
                    label: label.clone(),
                    environment: &environment,
                    context,
                };
                let steps = self.run_steps(&mut run).await;
                let failure = steps
                    .iter()
                    .find(|s| s.status == StepStatus::Failed)
                    .map(|s| FailureKind::for_step(&job.steps[s.index], job.steps[s.index].run.as_deref()));
                (steps, failure)
            }
            Err(e) => {
                self.event_tx
                    .send_event(ExecutionEvent::error(e.to_string(), Some(label.clone())));
                (Vec::new(), Some(FailureKind::Provisioning))
            }
        };

        match environment.teardown(self.config.keep_environments) {
            Ok(kept) => result.kept_environment = kept,
            Err(e) => warn!(instance = %label, error = %e, "failed to remove environment"),
        }

        let (steps, failure) = outcome;
        result.steps = steps;
        result.duration = start.elapsed();
        let status = if failure.is_some() {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Succeeded
        };
        self.finish(result, status, failure)
    }

    fn finish(
        &self,
        mut result: InstanceResult,
        status: InstanceStatus,
        failure: Option<FailureKind>,
    ) -> InstanceResult {
        result.status = status;
        result.failure = failure;
        match failure {
            Some(kind) => warn!(instance = %result.instance, %kind, "instance failed"),
            None => info!(instance = %result.instance, "instance succeeded"),
        }
        self.event_tx.send_event(ExecutionEvent::InstanceCompleted {
            job_id: result.job_id.clone(),
            instance: result.instance.clone(),
            status,
            failure,
            duration: result.duration,
        });
        result
    }

    /// Context for a job-level `if:`, evaluated before anything is provisioned
    fn job_condition_context(
        &self,
        job_id: &str,
        instance: &MatrixInstance,
    ) -> ServiceResult<ExpressionContext> {
        let mut context = ExpressionContext::new()
            .with_matrix(instance.values.iter().map(|(name, value)| (name, value)));
        context.set_github("event_name", self.event.name());
        context.set_github("ref", self.event.git_ref());
        context.set_github("ref_name", self.event.ref_name());
        context.set_github("base_ref", self.event.base_ref().unwrap_or_default());
        context.set_github("job", job_id);
        context.set_github("workflow", self.workflow.name.clone().unwrap_or_default());
        if let TriggerEvent::PullRequest {
            head_branch: Some(head),
            ..
        } = &self.event
        {
            context.set_github("head_ref", head.as_str());
        }
        context.set_runner("os", runner_os());
        for (name, value) in &self.workflow.env {
            let value = ExpressionEngine::interpolate(value, &context)?;
            context.set_env(name.clone(), value);
        }
        Ok(context)
    }

    /// Run the steps in order; after the first failure the rest are skipped.
    async fn run_steps(&self, run: &mut InstanceRun<'_>) -> Vec<StepResult> {
        let mut results = Vec::with_capacity(run.job.steps.len());
        let mut failed = false;

        for (index, step) in run.job.steps.iter().enumerate() {
            let name = step
                .name
                .as_deref()
                .and_then(|name| ExpressionEngine::interpolate(name, &run.context.expressions).ok())
                .unwrap_or_else(|| step.display_name());

            if failed {
                results.push(self.skip_step(run, index, name, "a previous step failed"));
                continue;
            }

            if let Some(condition) = &step.if_condition {
                let evaluated = run
                    .context
                    .step_scope(step)
                    .and_then(|(context, _)| ExpressionEngine::evaluate_condition(condition, &context));
                match evaluated {
                    Ok(true) => {}
                    Ok(false) => {
                        let reason = format!("condition '{}' evaluated to false", condition);
                        let skipped = self.skip_step(run, index, name, reason);
                        run.context.record_step(step, &skipped);
                        results.push(skipped);
                        continue;
                    }
                    Err(e) => {
                        let result = self.failed_before_start(run, index, name, e);
                        run.context.record_step(step, &result);
                        results.push(result);
                        failed = true;
                        continue;
                    }
                }
            }

            self.event_tx.send_event(ExecutionEvent::StepStarted {
                instance: run.label.clone(),
                step_index: index,
                display_name: name.clone(),
            });
            debug!(instance = %run.label, step = index, %name, "step started");

            let start = Instant::now();
            let outcome = match self.run_step(run, index, step).await {
                Ok(outcome) => outcome,
                Err(e) => StepOutcome::failure(e.to_string()),
            };

            let mut result = StepResult {
                index,
                name,
                status: if outcome.succeeded() {
                    StepStatus::Succeeded
                } else {
                    StepStatus::Failed
                },
                exit_code: outcome.exit_code,
                duration: start.elapsed(),
                error: outcome.error.clone(),
                outputs: HashMap::new(),
            };

            match run.environment.take_command_files() {
                Ok(files) => {
                    run.context.apply_command_files(&files);
                    result.outputs.extend(files.outputs);
                }
                Err(e) => {
                    result.status = StepStatus::Failed;
                    result.error = Some(e.to_string());
                }
            }

            for warning in &outcome.warnings {
                warn!(instance = %run.label, step = index, "{}", warning);
                self.event_tx
                    .send_event(ExecutionEvent::warning(warning.clone(), Some(run.label.clone())));
            }
            if let Some(error) = &result.error {
                self.event_tx.send_event(ExecutionEvent::error(
                    format!("{}: {}", result.name, error),
                    Some(run.label.clone()),
                ));
            }

            debug!(instance = %run.label, step = index, status = ?result.status, duration = ?result.duration, "step finished");
            self.event_tx.send_event(ExecutionEvent::StepCompleted {
                instance: run.label.clone(),
                step_index: index,
                status: result.status,
                duration: result.duration,
                exit_code: result.exit_code,
            });

            run.context.record_step(step, &result);
            failed = result.status == StepStatus::Failed;
            results.push(result);
        }

        results
    }

    async fn run_step(
        &self,
        run: &InstanceRun<'_>,
        index: usize,
        step: &Step,
    ) -> ServiceResult<StepOutcome> {
        let (expressions, step_env) = run.context.step_scope(step)?;

        let workspace = run.environment.workspace();
        let working_dir = match step
            .working_directory
            .as_deref()
            .or_else(|| step.run.as_ref().and(run.job.default_working_directory(&self.workflow)))
        {
            Some(dir) => resolve_dir(&workspace, &ExpressionEngine::interpolate(dir, &expressions)?),
            None => workspace,
        };

        let timeout = step
            .timeout_minutes
            .or(run.job.timeout_minutes)
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
            .or(self.config.default_step_timeout);

        let tx = self.event_tx.clone();
        let label = run.label.clone();
        let invocation = StepInvocation::new(index, run.environment)
            .with_env(run.context.process_env(&step_env))
            .with_working_dir(working_dir)
            .with_timeout(timeout)
            .with_output(Arc::new(move |line: &str, is_error: bool| {
                tx.send_event(ExecutionEvent::step_output(&label, index, line, is_error));
            }));

        if let Some(script) = &step.run {
            let script = ExpressionEngine::interpolate(script, &expressions)?;
            let shell = match step
                .shell
                .as_deref()
                .or_else(|| run.job.default_shell(&self.workflow))
            {
                Some(shell) => Some(ExpressionEngine::interpolate(shell, &expressions)?),
                None => None,
            };
            Ok(self.shell.run(&script, shell.as_deref(), &invocation).await)
        } else if let Some(uses) = &step.uses {
            let inputs = step
                .with
                .iter()
                .map(|(name, value)| {
                    Ok((
                        name.clone(),
                        ExpressionEngine::interpolate_value(value, &expressions)?,
                    ))
                })
                .collect::<ServiceResult<_>>()?;
            self.actions
                .run(uses, &ActionInputs::new(inputs), &invocation)
                .await
        } else {
            Err(ServiceError::invalid_workflow(format!(
                "step {} in job '{}' has neither 'run' nor 'uses'",
                index, run.job_id
            )))
        }
    }

    fn skip_step(
        &self,
        run: &InstanceRun<'_>,
        index: usize,
        name: String,
        reason: impl Into<String>,
    ) -> StepResult {
        let reason = reason.into();
        debug!(instance = %run.label, step = index, %reason, "step skipped");
        self.event_tx.send_event(ExecutionEvent::StepSkipped {
            instance: run.label.clone(),
            step_index: index,
            display_name: name.clone(),
            reason: reason.clone(),
        });
        StepResult::skipped(index, name, reason)
    }

    fn failed_before_start(
        &self,
        run: &InstanceRun<'_>,
        index: usize,
        name: String,
        error: ServiceError,
    ) -> StepResult {
        self.event_tx.send_event(ExecutionEvent::error(
            format!("{}: {}", name, error),
            Some(run.label.clone()),
        ));
        self.event_tx.send_event(ExecutionEvent::StepCompleted {
            instance: run.label.clone(),
            step_index: index,
            status: StepStatus::Failed,
            duration: Duration::ZERO,
            exit_code: None,
        });
        StepResult {
            index,
            name,
            status: StepStatus::Failed,
            exit_code: None,
            duration: Duration::ZERO,
            error: Some(error.to_string()),
            outputs: HashMap::new(),
        }
    }
}

async fn acquire(semaphore: Option<Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    // Semaphores are never closed, so acquisition only fails if that changes
    semaphore?.acquire_owned().await.ok()
}

fn resolve_dir(workspace: &Path, dir: &str) -> PathBuf {
    let dir = Path::new(dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        workspace.join(dir)
    }
}
