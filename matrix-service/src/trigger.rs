// Trigger Matching
// Decides whether a repository event starts a workflow run

use crate::workflow::models::{EventConfig, Trigger};

use glob::{MatchOptions, Pattern};
use tracing::debug;

const PUSH: &str = "push";
const PULL_REQUEST: &str = "pull_request";

/// A git ref as seen by a push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    Branch(String),
    Tag(String),
}

impl GitRef {
    /// Parse a full or short ref. `refs/tags/*` is a tag, anything else a branch.
    pub fn parse(raw: &str) -> Self {
        if let Some(tag) = raw.strip_prefix("refs/tags/") {
            GitRef::Tag(tag.to_string())
        } else {
            GitRef::Branch(raw.strip_prefix("refs/heads/").unwrap_or(raw).to_string())
        }
    }

    /// Short name (`master`, `v1.0`)
    pub fn name(&self) -> &str {
        match self {
            GitRef::Branch(name) | GitRef::Tag(name) => name,
        }
    }

    /// Fully-qualified ref (`refs/heads/master`)
    pub fn full(&self) -> String {
        match self {
            GitRef::Branch(name) => format!("refs/heads/{}", name),
            GitRef::Tag(name) => format!("refs/tags/{}", name),
        }
    }
}

/// A repository event that may trigger a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Push {
        git_ref: GitRef,
        changed_files: Vec<String>,
    },
    PullRequest {
        base_branch: String,
        head_branch: Option<String>,
        changed_files: Vec<String>,
    },
}

impl TriggerEvent {
    pub fn push_branch(branch: impl Into<String>) -> Self {
        TriggerEvent::Push {
            git_ref: GitRef::Branch(branch.into()),
            changed_files: Vec::new(),
        }
    }

    pub fn push_tag(tag: impl Into<String>) -> Self {
        TriggerEvent::Push {
            git_ref: GitRef::Tag(tag.into()),
            changed_files: Vec::new(),
        }
    }

    pub fn pull_request(base_branch: impl Into<String>) -> Self {
        TriggerEvent::PullRequest {
            base_branch: base_branch.into(),
            head_branch: None,
            changed_files: Vec::new(),
        }
    }

    pub fn with_head_branch(mut self, head: impl Into<String>) -> Self {
        if let TriggerEvent::PullRequest { head_branch, .. } = &mut self {
            *head_branch = Some(head.into());
        }
        self
    }

    pub fn with_changed_files(mut self, files: Vec<String>) -> Self {
        match &mut self {
            TriggerEvent::Push { changed_files, .. }
            | TriggerEvent::PullRequest { changed_files, .. } => *changed_files = files,
        }
        self
    }

    /// Event name as written under `on:`
    pub fn name(&self) -> &'static str {
        match self {
            TriggerEvent::Push { .. } => PUSH,
            TriggerEvent::PullRequest { .. } => PULL_REQUEST,
        }
    }

    /// Value of `github.ref` for this event
    pub fn git_ref(&self) -> String {
        match self {
            TriggerEvent::Push { git_ref, .. } => git_ref.full(),
            TriggerEvent::PullRequest {
                base_branch,
                head_branch,
                ..
            } => GitRef::Branch(head_branch.clone().unwrap_or_else(|| base_branch.clone())).full(),
        }
    }

    /// Value of `github.ref_name` for this event
    pub fn ref_name(&self) -> String {
        match self {
            TriggerEvent::Push { git_ref, .. } => git_ref.name().to_string(),
            TriggerEvent::PullRequest {
                base_branch,
                head_branch,
                ..
            } => head_branch.clone().unwrap_or_else(|| base_branch.clone()),
        }
    }

    /// Target branch of a pull request
    pub fn base_ref(&self) -> Option<&str> {
        match self {
            TriggerEvent::PullRequest { base_branch, .. } => Some(base_branch),
            TriggerEvent::Push { .. } => None,
        }
    }

    pub fn changed_files(&self) -> &[String] {
        match self {
            TriggerEvent::Push { changed_files, .. }
            | TriggerEvent::PullRequest { changed_files, .. } => changed_files,
        }
    }
}

/// Matches events against a workflow's `on:` block
pub struct TriggerMatcher;

impl TriggerMatcher {
    /// Check whether `event` starts a run of a workflow declaring `trigger`.
    pub fn matches(trigger: &Trigger, event: &TriggerEvent) -> bool {
        let matched = match trigger {
            Trigger::Single(name) => name == event.name(),
            Trigger::Multiple(names) => names.iter().any(|name| name == event.name()),
            Trigger::Detailed(events) => match events.get(event.name()) {
                None => false,
                Some(None) => true,
                Some(Some(config)) => Self::accepts(config, event),
            },
        };

        debug!(event = event.name(), git_ref = %event.git_ref(), matched, "evaluated trigger");
        matched
    }

    fn accepts(config: &EventConfig, event: &TriggerEvent) -> bool {
        let ref_ok = match event {
            TriggerEvent::Push { git_ref, .. } => {
                let has_branch_filters =
                    !config.branches.is_empty() || !config.branches_ignore.is_empty();
                let has_tag_filters = !config.tags.is_empty() || !config.tags_ignore.is_empty();

                match git_ref {
                    GitRef::Branch(branch) => {
                        if !has_branch_filters && has_tag_filters {
                            false
                        } else {
                            include_exclude(&config.branches, &config.branches_ignore, branch)
                        }
                    }
                    GitRef::Tag(tag) => {
                        if !has_tag_filters && has_branch_filters {
                            false
                        } else {
                            include_exclude(&config.tags, &config.tags_ignore, tag)
                        }
                    }
                }
            }
            TriggerEvent::PullRequest { base_branch, .. } => {
                include_exclude(&config.branches, &config.branches_ignore, base_branch)
            }
        };

        ref_ok && Self::paths_accept(config, event.changed_files())
    }

    fn paths_accept(config: &EventConfig, changed_files: &[String]) -> bool {
        // Without changed-file information there is nothing to filter on
        if changed_files.is_empty() || (config.paths.is_empty() && config.paths_ignore.is_empty())
        {
            return true;
        }

        changed_files
            .iter()
            .any(|file| include_exclude(&config.paths, &config.paths_ignore, file))
    }
}

/// An empty include list accepts everything; the ignore list always applies.
fn include_exclude(include: &[String], ignore: &[String], value: &str) -> bool {
    let included = include.is_empty() || filter_accepts(include, value);
    included && !ignore.iter().any(|pattern| glob_matches(pattern, value))
}

/// Evaluate a filter list where later `!pattern` entries can undo earlier matches.
fn filter_accepts(patterns: &[String], value: &str) -> bool {
    let mut accepted = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_matches(negated, value) {
                accepted = false;
            }
        } else if glob_matches(pattern, value) {
            accepted = true;
        }
    }
    accepted
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    match Pattern::new(pattern) {
        Ok(compiled) => compiled.matches_with(value, options),
        Err(_) => pattern == value,
    }
}
