use crate::commands::{load_workflow, workflow_label, EventArgs};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use matrix_service::{ExecutorConfig, WorkflowExecutor};

/// Show what a run would do without running it
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,

    /// Plan only a specific job
    #[arg(long, value_name = "JOB", env = "MATRIX_CI_JOB")]
    pub job: Option<String>,

    /// Maximum instances running at once
    #[arg(long, value_name = "N", env = "MATRIX_CI_MAX_PARALLEL")]
    pub max_parallel: Option<usize>,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let workflow = load_workflow(&args.workflow)?;
    let name = workflow_label(&workflow, &args.workflow);

    let repository = args.event.repository()?;
    let event = args.event.trigger_event(&repository)?;

    let mut config = ExecutorConfig::default()
        .with_repository(repository)
        .with_job(args.job.clone());
    if let Some(max_parallel) = args.max_parallel {
        config = config.with_max_parallel(max_parallel);
    }
    let plan = WorkflowExecutor::new(config).plan(&workflow, &event)?;

    output::header(&format!(
        "Workflow '{}' for {} on {}",
        name, plan.event_name, plan.git_ref
    ));
    if !plan.triggered {
        output::warning("Not triggered: no run would be created");
        return Ok(());
    }

    for job in &plan.jobs {
        let limit = job
            .max_parallel
            .map(|n| format!(", max-parallel {}", n))
            .unwrap_or_default();
        output::status(
            "Job",
            &format!("{} ({} instances{})", job.job_id, job.instances.len(), limit),
        );
        for instance in &job.instances {
            output::check(&instance.label(&job.job_id));
        }
        for (index, step) in job.step_names.iter().enumerate() {
            output::dim(&format!("      {}. {}", index + 1, step));
        }
    }

    println!();
    output::info(&format!(
        "{} instances, at most {} at a time",
        plan.total_instances(),
        plan.max_parallel
    ));

    Ok(())
}
