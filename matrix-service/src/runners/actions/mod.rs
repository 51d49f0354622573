// Local Actions
// Built-in implementations of the hosted `uses:` actions a workflow references

mod checkout;
mod codecov;
mod setup_python;

pub use checkout::Checkout;
pub use codecov::CodecovUpload;
pub use setup_python::SetupPython;

use crate::expression::to_display;
use crate::runners::{StepInvocation, StepOutcome};
use crate::{ServiceError, ServiceResult};

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Interpolated `with:` inputs of a step
#[derive(Debug, Clone, Default)]
pub struct ActionInputs {
    values: BTreeMap<String, Value>,
}

impl ActionInputs {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Input rendered as text; empty strings count as unset
    pub fn get(&self, name: &str) -> Option<String> {
        self.values
            .get(name)
            .map(to_display)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn require(&self, action: &str, name: &str) -> ServiceResult<String> {
        self.get(name)
            .ok_or_else(|| ServiceError::action(action, format!("input '{}' is required", name)))
    }

    /// Boolean input; accepts YAML booleans and `'true'`/`'false'` strings
    pub fn flag(&self, name: &str, default: bool) -> bool {
        match self.values.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(other) => match to_display(other).trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                _ => default,
            },
            None => default,
        }
    }

    /// List input: a YAML sequence, or text split on commas and newlines
    pub fn list(&self, name: &str) -> Vec<String> {
        match self.values.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .map(to_display)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(other) => to_display(other)
                .split([',', '\n'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// A `uses:` action implemented in-process
#[async_trait::async_trait]
pub trait LocalAction: Send + Sync {
    /// `owner/name` the action is registered under
    fn name(&self) -> &'static str;

    /// Run the action. Errors fail the step.
    async fn run(
        &self,
        inputs: &ActionInputs,
        invocation: &StepInvocation<'_>,
    ) -> ServiceResult<StepOutcome>;
}

/// Registry of local actions keyed by lowercase `owner/name`
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn LocalAction>>,
}

impl ActionRegistry {
    /// Registry with no actions
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in checkout, setup-python, and codecov actions
    pub fn new(repository: PathBuf, coverage_uploader: Option<PathBuf>) -> Self {
        Self::empty()
            .with_action(Checkout::new(repository))
            .with_action(SetupPython::new())
            .with_action(CodecovUpload::new(coverage_uploader))
    }

    /// Register (or replace) an action
    pub fn with_action(mut self, action: impl LocalAction + 'static) -> Self {
        self.actions
            .insert(action.name().to_lowercase(), Arc::new(action));
        self
    }

    /// Strip the `@ref` suffix and normalise case
    pub fn action_key(uses: &str) -> String {
        uses.split('@').next().unwrap_or(uses).trim().to_lowercase()
    }

    pub fn contains(&self, uses: &str) -> bool {
        self.actions.contains_key(&Self::action_key(uses))
    }

    pub fn resolve(&self, uses: &str) -> ServiceResult<Arc<dyn LocalAction>> {
        self.actions
            .get(&Self::action_key(uses))
            .cloned()
            .ok_or_else(|| ServiceError::UnsupportedAction(uses.to_string()))
    }

    /// Run the action `uses` refers to.
    pub async fn run(
        &self,
        uses: &str,
        inputs: &ActionInputs,
        invocation: &StepInvocation<'_>,
    ) -> ServiceResult<StepOutcome> {
        let action = self.resolve(uses)?;
        debug!(action = action.name(), step = invocation.index, "running local action");
        action.run(inputs, invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::environment::IsolatedEnvironment;

    struct Echo;

    #[async_trait::async_trait]
    impl LocalAction for Echo {
        fn name(&self) -> &'static str {
            "acme/Echo"
        }

        async fn run(
            &self,
            inputs: &ActionInputs,
            invocation: &StepInvocation<'_>,
        ) -> ServiceResult<StepOutcome> {
            let message = inputs.require(self.name(), "message")?;
            invocation.environment.set_output("message", &message)?;
            Ok(StepOutcome::success())
        }
    }

    fn inputs(yaml: &str) -> ActionInputs {
        ActionInputs::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn test_builtin_actions_resolve_with_any_ref() {
        let registry = ActionRegistry::new(PathBuf::from("."), None);
        assert!(registry.contains("actions/checkout@v3"));
        assert!(registry.contains("actions/setup-python@v4"));
        assert!(registry.contains("codecov/codecov-action@v3"));
        assert!(registry.contains("Actions/Checkout"));
    }

    #[test]
    fn test_unknown_action_is_unsupported() {
        let registry = ActionRegistry::new(PathBuf::from("."), None);
        let err = registry.resolve("actions/upload-artifact@v3").err().unwrap();
        assert!(matches!(err, ServiceError::UnsupportedAction(ref a) if a == "actions/upload-artifact@v3"));
    }

    #[tokio::test]
    async fn test_custom_action() {
        let root = tempfile::tempdir().unwrap();
        let env = IsolatedEnvironment::provision(root.path()).unwrap();
        let registry = ActionRegistry::empty().with_action(Echo);
        let invocation = StepInvocation::new(0, &env);

        let outcome = registry
            .run("acme/echo@main", &inputs("message: hi"), &invocation)
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(
            env.take_command_files().unwrap().outputs,
            vec![("message".to_string(), "hi".to_string())]
        );

        let err = registry
            .run("acme/echo@main", &inputs("{}"), &invocation)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("input 'message' is required"));
    }

    #[test]
    fn test_input_accessors() {
        let inputs = inputs(
            "python-version: 3.8\nfail_ci_if_error: 'true'\nfiles: ./a.xml, ./b.xml\nempty: ''\nlist: [x, y]\n",
        );
        assert_eq!(inputs.get("python-version").as_deref(), Some("3.8"));
        assert_eq!(inputs.get("empty"), None);
        assert!(inputs.flag("fail_ci_if_error", false));
        assert!(!inputs.flag("missing", false));
        assert_eq!(inputs.list("files"), vec!["./a.xml", "./b.xml"]);
        assert_eq!(inputs.list("list"), vec!["x", "y"]);
    }
}
