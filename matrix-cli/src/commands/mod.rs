// CLI Commands
// Subcommands plus the event and workflow options they share

pub mod plan;
pub mod run;
pub mod validate;

use std::path::{Path, PathBuf};

use clap::{Args, ValueEnum};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use matrix_service::utils::{current_branch, resolve_repository};
use matrix_service::{TriggerEvent, Workflow, WorkflowParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventKind {
    Push,
    PullRequest,
}

/// Describes the repository event to simulate
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event type
    #[arg(long, value_enum, default_value = "push", env = "MATRIX_CI_EVENT")]
    pub event: EventKind,

    /// Pushed branch, or the base branch of a pull request (default: current branch)
    #[arg(long, env = "MATRIX_CI_BRANCH", conflicts_with = "tag")]
    pub branch: Option<String>,

    /// Pushed tag
    #[arg(long, env = "MATRIX_CI_TAG")]
    pub tag: Option<String>,

    /// Base branch of a pull request
    #[arg(long, env = "MATRIX_CI_BASE")]
    pub base: Option<String>,

    /// Head branch of a pull request
    #[arg(long, env = "MATRIX_CI_HEAD")]
    pub head: Option<String>,

    /// File changed by the event, for `paths` filters (repeatable, comma-separated in the env var)
    #[arg(
        long = "changed-file",
        value_name = "PATH",
        env = "MATRIX_CI_CHANGED_FILES",
        value_delimiter = ','
    )]
    pub changed_files: Vec<String>,

    /// Repository to check out (default: enclosing git root of the current directory)
    #[arg(long, value_name = "DIR", env = "MATRIX_CI_REPO")]
    pub repo: Option<PathBuf>,
}

impl EventArgs {
    pub fn repository(&self) -> Result<PathBuf> {
        match &self.repo {
            Some(repo) if repo.is_dir() => Ok(repo.clone()),
            Some(repo) => bail!("Repository not found: {}", repo.display()),
            None => Ok(resolve_repository(&std::env::current_dir()?)),
        }
    }

    /// Build the event; branches default to the one checked out in `repo`.
    pub fn trigger_event(&self, repo: &Path) -> Result<TriggerEvent> {
        let detected = || current_branch(repo);

        let event = match self.event {
            EventKind::Push => match (&self.tag, &self.branch) {
                (Some(tag), _) => TriggerEvent::push_tag(tag),
                (None, Some(branch)) => TriggerEvent::push_branch(branch),
                (None, None) => match detected() {
                    Some(branch) => TriggerEvent::push_branch(branch),
                    None => bail!(
                        "Could not detect the current branch of {}; pass --branch",
                        repo.display()
                    ),
                },
            },
            EventKind::PullRequest => {
                let Some(base) = self.base.clone().or_else(|| self.branch.clone()) else {
                    bail!("Pull request events need --base");
                };
                let event = TriggerEvent::pull_request(base);
                match self.head.clone().or_else(detected) {
                    Some(head) => event.with_head_branch(head),
                    None => event,
                }
            }
        };

        Ok(event.with_changed_files(self.changed_files.clone()))
    }
}

/// Parse and validate a workflow file
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    if !path.exists() {
        bail!("Workflow file not found: {}", path.display());
    }
    WorkflowParser::load(path).wrap_err_with(|| format!("Failed to load {}", path.display()))
}

/// Name shown for a workflow without `name:`
pub fn workflow_label(workflow: &Workflow, path: &Path) -> String {
    workflow.name.clone().unwrap_or_else(|| {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workflow")
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        event: EventArgs,
    }

    fn event(args: &[&str]) -> TriggerEvent {
        let parsed = Harness::try_parse_from(std::iter::once("test").chain(args.iter().copied()))
            .unwrap();
        let scratch = tempfile::tempdir().unwrap();
        parsed.event.trigger_event(scratch.path()).unwrap()
    }

    #[test]
    fn test_push_events() {
        assert_eq!(event(&["--branch", "master"]), TriggerEvent::push_branch("master"));
        assert_eq!(event(&["--tag", "v1.0"]), TriggerEvent::push_tag("v1.0"));
        assert_eq!(
            event(&["--branch", "master", "--changed-file", "src/lib.rs"]),
            TriggerEvent::push_branch("master").with_changed_files(vec!["src/lib.rs".into()])
        );
    }

    #[test]
    fn test_pull_request_events() {
        assert_eq!(
            event(&["--event", "pull-request", "--base", "develop", "--head", "feature"]),
            TriggerEvent::pull_request("develop").with_head_branch("feature")
        );
    }

    #[test]
    fn test_pull_request_needs_base() {
        let parsed = Harness::try_parse_from(["test", "--event", "pull-request"]).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        assert!(parsed.event.trigger_event(scratch.path()).is_err());
    }

    #[test]
    fn test_changed_files_accept_comma_lists() {
        assert_eq!(
            event(&["--branch", "master", "--changed-file", "src/lib.rs,docs/ci.md"]),
            TriggerEvent::push_branch("master")
                .with_changed_files(vec!["src/lib.rs".into(), "docs/ci.md".into()])
        );
    }

    #[test]
    fn test_branch_conflicts_with_tag() {
        assert!(Harness::try_parse_from(["test", "--branch", "a", "--tag", "b"]).is_err());
    }
}
