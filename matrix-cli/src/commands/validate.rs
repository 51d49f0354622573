use crate::commands::workflow_label;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use matrix_service::{MatrixExpander, WorkflowParser};

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let path = &args.workflow;

    if !path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", path.display());
    }

    output::status("Validating", &format!("{}", path.display()));

    // Step 1: Parse YAML syntax
    let workflow = match WorkflowParser::from_file(path) {
        Ok(workflow) => workflow,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            std::process::exit(1);
        }
    };
    output::check("YAML syntax valid");

    // Step 2: Semantic validation
    if let Err(e) = WorkflowParser::validate(&workflow) {
        output::error(&e.to_string());
        std::process::exit(1);
    }
    output::check("Semantic validation passed");

    // Step 3: Structure summary
    let mut instances = 0;
    for job_id in workflow.job_ids() {
        let job = &workflow.jobs[job_id];
        let expanded = MatrixExpander::expand_strategy(job.strategy.as_ref())?;
        instances += expanded.len();
        output::check(&format!(
            "Job '{}': {} instances, {} steps",
            job_id,
            expanded.len(),
            job.steps.len()
        ));
    }
    output::check(&format!(
        "Triggers: {}",
        workflow.on.event_names().join(", ")
    ));

    println!();
    output::success(&format!(
        "Workflow '{}' is valid ({} jobs, {} instances)",
        workflow_label(&workflow, path),
        workflow.jobs.len(),
        instances
    ));

    Ok(())
}
