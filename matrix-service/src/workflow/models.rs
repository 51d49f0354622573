use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A GitHub Actions-compatible workflow definition.
///
/// This represents the top-level structure of a workflow YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// The name of the workflow
    pub name: Option<String>,

    /// The trigger configuration for the workflow
    #[serde(rename = "on")]
    pub on: Trigger,

    /// Workflow-level environment variables
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,

    /// Default settings for all jobs in the workflow
    #[serde(default)]
    pub defaults: Option<Defaults>,

    /// The jobs that make up this workflow
    pub jobs: HashMap<String, Job>,
}

impl Workflow {
    /// Job ids in the order they are scheduled.
    pub fn job_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Trigger configuration for when the workflow should run.
///
/// Supports multiple trigger formats:
/// - Simple: `on: push`
/// - List: `on: [push, pull_request]`
/// - Detailed: `on: { push: { branches: [main] } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    /// Single event trigger: `on: push`
    Single(String),

    /// Multiple events: `on: [push, pull_request]`
    Multiple(Vec<String>),

    /// Detailed event configuration
    Detailed(HashMap<String, Option<EventConfig>>),
}

impl Trigger {
    /// Names of all declared events.
    pub fn event_names(&self) -> Vec<String> {
        let mut names = match self {
            Trigger::Single(name) => vec![name.clone()],
            Trigger::Multiple(names) => names.clone(),
            Trigger::Detailed(events) => events.keys().cloned().collect(),
        };
        names.sort();
        names
    }
}

/// Filters for a specific trigger event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventConfig {
    /// Branch filters for push/pull_request events
    #[serde(default)]
    pub branches: Vec<String>,

    /// Branch ignore patterns
    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,

    /// Tag filters for push events
    #[serde(default)]
    pub tags: Vec<String>,

    /// Tag ignore patterns
    #[serde(default, rename = "tags-ignore")]
    pub tags_ignore: Vec<String>,

    /// Path filters
    #[serde(default)]
    pub paths: Vec<String>,

    /// Path ignore patterns
    #[serde(default, rename = "paths-ignore")]
    pub paths_ignore: Vec<String>,

    /// Activity types (parsed, not filtered on)
    #[serde(default)]
    pub types: Vec<String>,
}

/// Default settings for jobs and steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Defaults {
    /// Default settings for run steps
    #[serde(default)]
    pub run: Option<RunDefaults>,
}

/// Default settings for run steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunDefaults {
    /// Default shell to use
    #[serde(default)]
    pub shell: Option<String>,

    /// Default working directory
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,
}

/// A job within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Display name for the job
    #[serde(default)]
    pub name: Option<String>,

    /// Runner label (recorded, the job always runs on the local host)
    #[serde(default, rename = "runs-on")]
    pub runs_on: Option<RunsOn>,

    /// Conditional expression for job execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Job-level environment variables
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,

    /// Default settings for steps in this job
    #[serde(default)]
    pub defaults: Option<Defaults>,

    /// Matrix strategy for running multiple job instances
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// The steps that make up this job
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Job timeout in minutes
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u32>,
}

impl Job {
    /// The shell run steps fall back to when they don't name one.
    pub fn default_shell<'a>(&'a self, workflow: &'a Workflow) -> Option<&'a str> {
        run_default(&self.defaults, |run| run.shell.as_deref())
            .or_else(|| run_default(&workflow.defaults, |run| run.shell.as_deref()))
    }

    /// The working directory run steps fall back to when they don't name one.
    pub fn default_working_directory<'a>(&'a self, workflow: &'a Workflow) -> Option<&'a str> {
        run_default(&self.defaults, |run| run.working_directory.as_deref())
            .or_else(|| run_default(&workflow.defaults, |run| run.working_directory.as_deref()))
    }
}

fn run_default<'a>(
    defaults: &'a Option<Defaults>,
    pick: impl Fn(&'a RunDefaults) -> Option<&'a str>,
) -> Option<&'a str> {
    defaults.as_ref()?.run.as_ref().and_then(pick)
}

/// `runs-on`: a single label or a list of labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunsOn {
    /// Single runner label: `runs-on: ubuntu-latest`
    Label(String),

    /// Multiple labels: `runs-on: [self-hosted, linux]`
    Labels(Vec<String>),
}

impl RunsOn {
    pub fn labels(&self) -> Vec<&str> {
        match self {
            RunsOn::Label(label) => vec![label.as_str()],
            RunsOn::Labels(labels) => labels.iter().map(String::as_str).collect(),
        }
    }
}

/// Strategy configuration for matrix builds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Strategy {
    /// Matrix configuration
    #[serde(default)]
    pub matrix: Option<Matrix>,

    /// Maximum number of this job's instances to run in parallel
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<u32>,

    /// Accepted for compatibility; instances never cancel each other
    #[serde(default, rename = "fail-fast")]
    pub fail_fast: Option<bool>,
}

/// A named matrix dimension with its values in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<Value>,
}

/// Matrix configuration for parallel job execution.
///
/// Axes keep the order in which they appear in the YAML document, so the
/// expanded instances come out in a stable, predictable order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matrix {
    /// Matrix dimensions
    pub axes: Vec<MatrixAxis>,

    /// Additional matrix combinations to include
    pub include: Vec<Map<String, Value>>,

    /// Matrix combinations to exclude
    pub exclude: Vec<Map<String, Value>>,
}

impl Matrix {
    pub fn axis(&self, name: &str) -> Option<&MatrixAxis> {
        self.axes.iter().find(|axis| axis.name == name)
    }
}

impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MatrixVisitor;

        impl<'de> Visitor<'de> for MatrixVisitor {
            type Value = Matrix;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of matrix axis names to value lists")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Matrix, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut matrix = Matrix::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "include" => matrix.include = map.next_value()?,
                        "exclude" => matrix.exclude = map.next_value()?,
                        _ => {
                            if matrix.axis(&key).is_some() {
                                return Err(de::Error::custom(format!(
                                    "duplicate matrix axis '{}'",
                                    key
                                )));
                            }
                            let values: Vec<Value> = map.next_value()?;
                            matrix.axes.push(MatrixAxis { name: key, values });
                        }
                    }
                }
                Ok(matrix)
            }
        }

        deserializer.deserialize_map(MatrixVisitor)
    }
}

impl Serialize for Matrix {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        for axis in &self.axes {
            map.serialize_entry(&axis.name, &axis.values)?;
        }
        if !self.include.is_empty() {
            map.serialize_entry("include", &self.include)?;
        }
        if !self.exclude.is_empty() {
            map.serialize_entry("exclude", &self.exclude)?;
        }
        map.end()
    }
}

/// A step within a job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Step {
    /// Unique identifier for the step (used in outputs)
    #[serde(default)]
    pub id: Option<String>,

    /// Display name for the step
    #[serde(default)]
    pub name: Option<String>,

    /// Conditional expression for step execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Shell command to run
    #[serde(default)]
    pub run: Option<String>,

    /// Shell to use for the run command
    #[serde(default)]
    pub shell: Option<String>,

    /// Working directory for the step
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Action to use (e.g., "actions/checkout@v4")
    #[serde(default)]
    pub uses: Option<String>,

    /// Inputs to pass to the action
    #[serde(default)]
    pub with: BTreeMap<String, Value>,

    /// Step-level environment variables
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,

    /// Step timeout in minutes
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u32>,
}

impl Step {
    /// Get a display name for the step.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(uses) = &self.uses {
            format!("Run {}", uses)
        } else if let Some(run) = &self.run {
            // Truncate long commands
            let first_line = run.lines().next().unwrap_or(run);
            if first_line.chars().count() > 50 {
                let head: String = first_line.chars().take(47).collect();
                format!("{}...", head)
            } else {
                format!("Run {}", first_line)
            }
        } else {
            "Unnamed step".to_string()
        }
    }

    /// Check if this is a run step.
    pub fn is_run(&self) -> bool {
        self.run.is_some()
    }

    /// Check if this is a uses step.
    pub fn is_uses(&self) -> bool {
        self.uses.is_some()
    }
}

/// Environment maps accept any scalar and store its string form, so
/// `RETRIES: 3` and `DEBUG: true` parse the way the runner sees them.
fn deserialize_env<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            Value::Null => Ok((key, String::new())),
            Value::Bool(_) | Value::Number(_) => Ok((key, value.to_string())),
            other => Err(de::Error::custom(format!(
                "environment variable '{}' must be a scalar, got {}",
                key, other
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_workflow() {
        let yaml = r#"
name: CI
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo "Hello, World!"
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.name, Some("CI".to_string()));
        assert!(matches!(workflow.on, Trigger::Single(ref s) if s == "push"));
        assert!(workflow.jobs.contains_key("build"));
    }

    #[test]
    fn test_parse_detailed_triggers() {
        let yaml = r#"
on:
  push:
    branches: [ master ]
  pull_request:
    branches: [ '**' ]
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: make test
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let Trigger::Detailed(events) = &workflow.on else {
            panic!("Expected detailed trigger");
        };
        let push = events.get("push").unwrap().as_ref().unwrap();
        assert_eq!(push.branches, vec!["master"]);
        let pr = events.get("pull_request").unwrap().as_ref().unwrap();
        assert_eq!(pr.branches, vec!["**"]);
        assert_eq!(workflow.on.event_names(), vec!["pull_request", "push"]);
    }

    #[test]
    fn test_matrix_axes_keep_declaration_order() {
        let yaml = r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    strategy:
      max-parallel: 4
      matrix:
        python: [3.8]
        torch: [1.10.0, 2.0.0]
        include:
          - python: 3.8
            experimental: true
        exclude:
          - torch: 2.0.0
    steps:
      - run: echo "Testing"
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let strategy = workflow.jobs["test"].strategy.as_ref().unwrap();
        assert_eq!(strategy.max_parallel, Some(4));

        let matrix = strategy.matrix.as_ref().unwrap();
        let names: Vec<_> = matrix.axes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["python", "torch"]);
        assert_eq!(
            matrix.axis("torch").unwrap().values,
            vec![Value::from("1.10.0"), Value::from("2.0.0")]
        );
        assert_eq!(matrix.include.len(), 1);
        assert_eq!(matrix.exclude.len(), 1);
    }

    #[test]
    fn test_duplicate_matrix_axis_is_rejected() {
        let yaml = "python: [3.8]\npython: [3.9]\n";
        let result: Result<Matrix, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_matrix_serializes_back_to_mapping() {
        let matrix: Matrix = serde_yaml::from_str("os: [linux]\nrust: [stable, beta]\n").unwrap();
        let json = serde_json::to_value(&matrix).unwrap();
        assert_eq!(json["rust"], serde_json::json!(["stable", "beta"]));
        assert!(json.get("include").is_none());
    }

    #[test]
    fn test_parse_step_with_uses() {
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v3
      - uses: codecov/codecov-action@v3
        with:
          files: ./coverage.xml
          fail_ci_if_error: true
      - run: make test
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let job = workflow.jobs.get("build").unwrap();

        assert!(job.steps[0].is_uses());
        assert_eq!(job.steps[0].uses, Some("actions/checkout@v3".to_string()));
        assert_eq!(job.steps[1].with["fail_ci_if_error"], Value::Bool(true));
        assert!(job.steps[2].is_run());
    }

    #[test]
    fn test_env_scalars_become_strings() {
        let yaml = r#"
on: push
env:
  RETRIES: 3
  VERBOSE: true
jobs:
  build:
    runs-on: ubuntu-latest
    env:
      JOB_VAR: job
    steps:
      - run: echo "Hello"
        env:
          STEP_VAR: ~
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.env["RETRIES"], "3");
        assert_eq!(workflow.env["VERBOSE"], "true");
        let job = &workflow.jobs["build"];
        assert_eq!(job.env["JOB_VAR"], "job");
        assert_eq!(job.steps[0].env["STEP_VAR"], "");
    }

    #[test]
    fn test_defaults_fall_back_to_workflow() {
        let yaml = r#"
on: push
defaults:
  run:
    shell: bash
    working-directory: src
jobs:
  build:
    runs-on: ubuntu-latest
    defaults:
      run:
        working-directory: pkg
    steps:
      - run: ls
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let job = &workflow.jobs["build"];
        assert_eq!(job.default_shell(&workflow), Some("bash"));
        assert_eq!(job.default_working_directory(&workflow), Some("pkg"));
    }

    #[test]
    fn test_step_display_name() {
        let named = Step {
            name: Some("Install dependencies".to_string()),
            run: Some("make dev".to_string()),
            ..Default::default()
        };
        assert_eq!(named.display_name(), "Install dependencies");

        let action = Step {
            uses: Some("actions/checkout@v3".to_string()),
            ..Default::default()
        };
        assert_eq!(action.display_name(), "Run actions/checkout@v3");

        let script = Step {
            run: Some("make check\nmake test".to_string()),
            ..Default::default()
        };
        assert_eq!(script.display_name(), "Run make check");
    }

    #[test]
    fn test_job_ids_are_sorted() {
        let yaml = r#"
on: push
jobs:
  test:
    steps: [{ run: "true" }]
  lint:
    steps: [{ run: "true" }]
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.job_ids(), vec!["lint", "test"]);
    }
}
