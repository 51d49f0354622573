use crate::workflow::models::{Matrix, Workflow};
use crate::{ServiceError, ServiceResult};

use std::fs;
use std::path::Path;

/// Parser for GitHub Actions workflow YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ServiceResult<Workflow> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a workflow from a YAML string.
    pub fn parse(content: &str) -> ServiceResult<Workflow> {
        let workflow: Workflow = serde_yaml::from_str(content)?;
        Ok(workflow)
    }

    /// Parse and validate a workflow from a YAML string.
    ///
    /// This performs additional validation beyond basic YAML parsing.
    pub fn parse_and_validate(content: &str) -> ServiceResult<Workflow> {
        let workflow = Self::parse(content)?;
        Self::validate(&workflow)?;
        Ok(workflow)
    }

    /// Parse and validate a workflow file.
    pub fn load<P: AsRef<Path>>(path: P) -> ServiceResult<Workflow> {
        let workflow = Self::from_file(path)?;
        Self::validate(&workflow)?;
        Ok(workflow)
    }

    /// Validate a parsed workflow for semantic correctness.
    pub fn validate(workflow: &Workflow) -> ServiceResult<()> {
        if workflow.jobs.is_empty() {
            return Err(ServiceError::invalid_workflow("Workflow defines no jobs"));
        }

        for job_id in workflow.job_ids() {
            let job = &workflow.jobs[job_id];

            if job.steps.is_empty() {
                return Err(ServiceError::invalid_workflow(format!(
                    "Job '{}' has no steps",
                    job_id
                )));
            }

            // Steps need either 'run' or 'uses' (not both, not neither)
            for (step_idx, step) in job.steps.iter().enumerate() {
                let step_name = step.name.as_deref().unwrap_or("unnamed");
                match (step.run.is_some(), step.uses.is_some()) {
                    (false, false) => {
                        return Err(ServiceError::invalid_workflow(format!(
                            "Step {} '{}' in job '{}' must have either 'run' or 'uses'",
                            step_idx, step_name, job_id
                        )));
                    }
                    (true, true) => {
                        return Err(ServiceError::invalid_workflow(format!(
                            "Step {} '{}' in job '{}' cannot have both 'run' and 'uses'",
                            step_idx, step_name, job_id
                        )));
                    }
                    _ => {}
                }
            }

            if let Some(strategy) = &job.strategy {
                if strategy.max_parallel == Some(0) {
                    return Err(ServiceError::invalid_workflow(format!(
                        "Job '{}' sets max-parallel to 0",
                        job_id
                    )));
                }
                if let Some(matrix) = &strategy.matrix {
                    Self::validate_matrix(job_id, matrix)?;
                }
            }
        }

        Ok(())
    }

    fn validate_matrix(job_id: &str, matrix: &Matrix) -> ServiceResult<()> {
        if matrix.axes.is_empty() && matrix.include.is_empty() {
            return Err(ServiceError::invalid_matrix(format!(
                "Job '{}' declares a matrix with no axes",
                job_id
            )));
        }

        for axis in &matrix.axes {
            if axis.values.is_empty() {
                return Err(ServiceError::invalid_matrix(format!(
                    "Matrix axis '{}' in job '{}' has no values",
                    axis.name, job_id
                )));
            }
        }

        for entry in &matrix.exclude {
            if let Some(key) = entry.keys().find(|key| matrix.axis(key).is_none()) {
                return Err(ServiceError::invalid_matrix(format!(
                    "Exclude entry in job '{}' names unknown axis '{}'",
                    job_id, key
                )));
            }
        }

        Ok(())
    }
}
