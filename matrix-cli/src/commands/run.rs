use crate::commands::{load_workflow, workflow_label, EventArgs};
use crate::output;

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use color_eyre::Result;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use matrix_service::execution::{progress_channel, LogLevel};
use matrix_service::{
    ExecutionEvent, ExecutorConfig, InstanceStatus, RunResult, RunStatus, StepStatus,
    WorkflowExecutor,
};

/// Run a workflow's matrix locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,

    /// Run only a specific job
    #[arg(long, value_name = "JOB", env = "MATRIX_CI_JOB")]
    pub job: Option<String>,

    /// Maximum instances running at once
    #[arg(long, value_name = "N", env = "MATRIX_CI_MAX_PARALLEL")]
    pub max_parallel: Option<usize>,

    /// Directory isolated environments are created under
    #[arg(long, value_name = "DIR", env = "MATRIX_CI_ENV_ROOT")]
    pub env_root: Option<PathBuf>,

    /// Keep instance environments on disk after the run
    #[arg(long, env = "MATRIX_CI_KEEP_ENVS")]
    pub keep_envs: bool,

    /// Coverage uploader used instead of `codecov` on PATH
    #[arg(long, value_name = "PATH", env = "MATRIX_CI_COVERAGE_UPLOADER")]
    pub coverage_uploader: Option<PathBuf>,

    /// Timeout for steps without `timeout-minutes` (0 disables it)
    #[arg(long, value_name = "MINUTES", env = "MATRIX_CI_STEP_TIMEOUT")]
    pub step_timeout: Option<u64>,
}

impl RunArgs {
    fn config(&self, repository: PathBuf) -> ExecutorConfig {
        let mut config = ExecutorConfig::default()
            .with_repository(repository)
            .with_keep_environments(self.keep_envs)
            .with_coverage_uploader(self.coverage_uploader.clone())
            .with_job(self.job.clone());
        if let Some(max_parallel) = self.max_parallel {
            config = config.with_max_parallel(max_parallel);
        }
        if let Some(env_root) = &self.env_root {
            config = config.with_env_root(env_root);
        }
        if let Some(minutes) = self.step_timeout {
            config = config.with_default_step_timeout(
                (minutes > 0).then(|| Duration::from_secs(minutes * 60)),
            );
        }
        config
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    output::status("Parsing", &format!("{}", args.workflow.display()));
    let workflow = load_workflow(&args.workflow)?;
    let name = workflow_label(&workflow, &args.workflow);

    let repository = args.event.repository()?;
    let event = args.event.trigger_event(&repository)?;
    output::info(&format!(
        "Workflow '{}': {} jobs, event {} on {}",
        name,
        workflow.jobs.len(),
        event.name(),
        event.git_ref()
    ));

    let (tx, rx) = progress_channel();
    let executor = WorkflowExecutor::new(args.config(repository)).with_progress(tx);

    // Spawn execution in background
    let exec_handle = tokio::spawn(async move { executor.execute(&workflow, &event).await });

    // Process events in the foreground
    let mut events = UnboundedReceiverStream::new(rx);
    while let Some(event) = events.next().await {
        render(&event);
    }

    let result = exec_handle.await??;
    summarize(&result);

    if !result.success() {
        std::process::exit(1);
    }

    Ok(())
}

fn render(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            workflow_name,
            total_instances,
            max_parallel,
        } => {
            println!();
            output::header(&format!(
                "Workflow '{}' ({} instances, {} at a time)",
                workflow_name, total_instances, max_parallel
            ));
        }

        ExecutionEvent::RunNotTriggered {
            workflow_name,
            event_name,
            git_ref,
        } => {
            output::warning(&format!(
                "Workflow '{}' is not triggered by {} on {}",
                workflow_name, event_name, git_ref
            ));
        }

        ExecutionEvent::RunCompleted { .. } => {}

        ExecutionEvent::InstanceQueued { instance, .. } => {
            output::dim(&format!("  Queued '{}'", instance));
        }

        ExecutionEvent::InstanceStarted {
            instance,
            total_steps,
            ..
        } => output::instance_header(instance, *total_steps),

        ExecutionEvent::InstanceCompleted {
            instance,
            status,
            failure,
            duration,
            ..
        } => {
            let line = match failure {
                Some(kind) => format!(
                    "  Instance '{}' FAIL: {} ({:.2}s)",
                    instance,
                    kind,
                    duration.as_secs_f64()
                ),
                None => format!(
                    "  Instance '{}' OK ({:.2}s)",
                    instance,
                    duration.as_secs_f64()
                ),
            };
            if *status == InstanceStatus::Failed {
                output::dim_failure(&line);
            } else {
                output::dim_success(&line);
            }
        }

        ExecutionEvent::InstanceSkipped {
            instance, reason, ..
        } => {
            output::warning(&format!("  Instance '{}' skipped: {}", instance, reason));
        }

        ExecutionEvent::StepStarted {
            instance,
            step_index,
            display_name,
        } => {
            println!("    [{}] Step {}: {}", instance, step_index + 1, display_name);
        }

        ExecutionEvent::StepOutput {
            instance,
            output,
            is_error,
            ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::step_error(instance, line);
                } else {
                    output::step_output(instance, line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            instance,
            step_index,
            status,
            duration,
            exit_code,
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "    [{}] Step {} {} ({:.2}s){}",
                instance,
                step_index + 1,
                if *status == StepStatus::Succeeded { "OK" } else { "FAIL" },
                duration.as_secs_f64(),
                exit_info,
            );
            if *status == StepStatus::Succeeded {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::StepSkipped {
            instance,
            display_name,
            reason,
            ..
        } => {
            output::dim(&format!("    [{}] {} skipped: {}", instance, display_name, reason));
        }

        ExecutionEvent::Log {
            level,
            message,
            instance,
        } => {
            let message = match instance {
                Some(instance) => format!("[{}] {}", instance, message),
                None => message.clone(),
            };
            match level {
                LogLevel::Error => output::error(&message),
                LogLevel::Warning => output::warning(&message),
                _ => output::dim(&message),
            }
        }
    }
}

fn summarize(result: &RunResult) {
    if result.status == RunStatus::NotTriggered {
        return;
    }

    println!();
    for instance in &result.instances {
        match instance.status {
            InstanceStatus::Succeeded => output::check(&instance.instance),
            InstanceStatus::Skipped => output::dim(&format!("  - {} (skipped)", instance.instance)),
            InstanceStatus::Failed => {
                let detail = instance
                    .failed_step()
                    .map(|step| format!(" at step '{}'", step.name))
                    .unwrap_or_default();
                let kind = instance
                    .failure
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| "failure".to_string());
                output::failure(&format!("{} ({}{})", instance.instance, kind, detail));
            }
        }
        if let Some(kept) = &instance.kept_environment {
            output::dim(&format!("      environment kept at {}", kept.display()));
        }
    }

    println!();
    let duration = result.duration.as_secs_f64();
    if result.success() {
        output::success(&format!(
            "Workflow '{}' succeeded in {:.2}s",
            result.workflow_name, duration
        ));
    } else {
        output::failure(&format!(
            "Workflow '{}' failed after {:.2}s ({} of {} instances failed)",
            result.workflow_name,
            duration,
            result.failed_instances().count(),
            result.instances.len()
        ));
    }
}
