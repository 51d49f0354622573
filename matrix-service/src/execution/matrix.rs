// Matrix Strategy Expansion
// Expands matrix strategies into concrete job instances

use crate::expression::to_display;
use crate::workflow::models::{Matrix, Strategy};
use crate::{ServiceError, ServiceResult};

use serde_json::{Map, Value};

/// Upper bound on instances a single job may expand to
pub const MAX_INSTANCES: usize = 256;

/// A single matrix instance (one combination of matrix values)
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixInstance {
    /// Name of this instance (combination of values)
    pub name: String,
    /// Axis values in axis order, followed by keys added through `include`
    pub values: Vec<(String, Value)>,
}

impl MatrixInstance {
    fn from_values(values: Vec<(String, Value)>) -> Self {
        let name = values
            .iter()
            .map(|(_, value)| match value {
                Value::Array(_) | Value::Object(_) => value.to_string(),
                scalar => to_display(scalar),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Self { name, values }
    }

    /// The instance of a job without a matrix
    pub fn single() -> Self {
        Self {
            name: String::new(),
            values: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Values as the `matrix` expression context
    pub fn to_map(&self) -> Map<String, Value> {
        self.values.iter().cloned().collect()
    }

    /// Display label for a job instance, `build (3.8, 1.10.0)`
    pub fn label(&self, job_id: &str) -> String {
        if self.name.is_empty() {
            job_id.to_string()
        } else {
            format!("{} ({})", job_id, self.name)
        }
    }
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a job's strategy; a job without a matrix runs once.
    pub fn expand_strategy(strategy: Option<&Strategy>) -> ServiceResult<Vec<MatrixInstance>> {
        match strategy.and_then(|s| s.matrix.as_ref()) {
            Some(matrix) => Self::expand(matrix),
            None => Ok(vec![MatrixInstance::single()]),
        }
    }

    /// Expand a matrix into instances: cross product, then `exclude`, then `include`.
    pub fn expand(matrix: &Matrix) -> ServiceResult<Vec<MatrixInstance>> {
        if let Some(axis) = matrix.axes.iter().find(|axis| axis.values.is_empty()) {
            return Err(ServiceError::invalid_matrix(format!(
                "axis '{}' has no values",
                axis.name
            )));
        }

        let mut combinations = Self::cross_product(matrix);

        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|entry| entry_matches(entry, combo, |_| true))
        });

        let original_count = combinations.len();
        for entry in &matrix.include {
            let mut applied = false;
            for combo in combinations.iter_mut().take(original_count) {
                let is_axis = |key: &str| matrix.axis(key).is_some();
                if !entry_matches(entry, combo, is_axis) {
                    continue;
                }
                for (key, value) in entry.iter().filter(|(key, _)| !is_axis(key.as_str())) {
                    match combo.iter_mut().find(|(k, _)| k == key) {
                        Some(slot) => slot.1 = value.clone(),
                        None => combo.push((key.clone(), value.clone())),
                    }
                }
                applied = true;
            }
            if !applied {
                combinations.push(
                    entry
                        .iter()
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect(),
                );
            }
        }

        if combinations.is_empty() {
            return Err(ServiceError::invalid_matrix(
                "matrix expands to zero combinations",
            ));
        }
        if combinations.len() > MAX_INSTANCES {
            return Err(ServiceError::invalid_matrix(format!(
                "matrix expands to {} combinations (limit {})",
                combinations.len(),
                MAX_INSTANCES
            )));
        }

        Ok(combinations
            .into_iter()
            .map(MatrixInstance::from_values)
            .collect())
    }

    /// Set product of all axes; the first axis varies slowest.
    fn cross_product(matrix: &Matrix) -> Vec<Vec<(String, Value)>> {
        if matrix.axes.is_empty() {
            return Vec::new();
        }

        matrix.axes.iter().fold(vec![Vec::new()], |acc, axis| {
            acc.into_iter()
                .flat_map(|prefix| {
                    axis.values.iter().map(move |value| {
                        let mut combo = prefix.clone();
                        combo.push((axis.name.clone(), value.clone()));
                        combo
                    })
                })
                .collect()
        })
    }

    /// Get the maximum parallel limit from a strategy
    pub fn max_parallel(strategy: Option<&Strategy>) -> Option<usize> {
        strategy.and_then(|s| s.max_parallel).map(|n| n as usize)
    }
}

/// Whether every considered key of `entry` agrees with `combo`.
/// Values compare by their rendered form so `3.8` and `'3.8'` agree.
fn entry_matches(
    entry: &Map<String, Value>,
    combo: &[(String, Value)],
    consider: impl Fn(&str) -> bool,
) -> bool {
    entry
        .iter()
        .filter(|(key, _)| consider(key.as_str()))
        .all(|(key, expected)| {
            combo
                .iter()
                .find(|(k, _)| k == key)
                .is_some_and(|(_, actual)| same_value(actual, expected))
        })
}

fn same_value(a: &Value, b: &Value) -> bool {
    a == b || to_display(a) == to_display(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkflowParser;

    fn matrix(yaml: &str) -> Matrix {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn names(instances: &[MatrixInstance]) -> Vec<&str> {
        instances.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn test_demo_matrix_is_full_cross_product() {
        let workflow = WorkflowParser::parse(include_str!("../../../demos/ci.yml")).unwrap();
        let strategy = workflow.jobs["build"].strategy.as_ref();
        let instances = MatrixExpander::expand_strategy(strategy).unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(names(&instances), vec!["3.8, 1.10.0", "3.8, 2.0.0"]);
        for instance in &instances {
            assert_eq!(instance.get("python"), Some(&serde_json::json!(3.8)));
        }
        assert_eq!(instances[0].get("torch"), Some(&Value::from("1.10.0")));
        assert_eq!(instances[1].get("torch"), Some(&Value::from("2.0.0")));
        assert_eq!(MatrixExpander::max_parallel(strategy), Some(4));
    }

    #[test]
    fn test_cross_product_order_first_axis_slowest() {
        let instances = MatrixExpander::expand(&matrix("os: [linux, mac]\nv: [1, 2, 3]\n")).unwrap();
        assert_eq!(
            names(&instances),
            vec!["linux, 1", "linux, 2", "linux, 3", "mac, 1", "mac, 2", "mac, 3"]
        );
    }

    #[test]
    fn test_every_tuple_appears_exactly_once() {
        let instances =
            MatrixExpander::expand(&matrix("a: [1, 2, 3]\nb: [x, y]\nc: [true, false]\n"))
                .unwrap();
        assert_eq!(instances.len(), 12);
        let mut unique = names(&instances);
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 12);
    }

    #[test]
    fn test_exclude_removes_matching_combinations() {
        let instances = MatrixExpander::expand(&matrix(
            "python: [3.8, 3.9]\ntorch: [1.10.0, 2.0.0]\nexclude:\n  - python: 3.9\n    torch: 1.10.0\n",
        ))
        .unwrap();
        assert_eq!(
            names(&instances),
            vec!["3.8, 1.10.0", "3.8, 2.0.0", "3.9, 2.0.0"]
        );
    }

    #[test]
    fn test_include_extends_matching_combinations() {
        let instances = MatrixExpander::expand(&matrix(
            "python: [3.8]\ntorch: [1.10.0, 2.0.0]\ninclude:\n  - torch: 2.0.0\n    experimental: true\n",
        ))
        .unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].get("experimental"), None);
        assert_eq!(instances[1].get("experimental"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_include_without_match_appends_combination() {
        let instances = MatrixExpander::expand(&matrix(
            "python: [3.8]\ntorch: [2.0.0]\ninclude:\n  - python: '3.11'\n    torch: 2.1.0\n",
        ))
        .unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].get("python"), Some(&Value::from("3.11")));
        assert_eq!(instances[1].get("torch"), Some(&Value::from("2.1.0")));
    }

    #[test]
    fn test_include_only_matrix() {
        let instances =
            MatrixExpander::expand(&matrix("include:\n  - os: linux\n  - os: mac\n")).unwrap();
        assert_eq!(names(&instances), vec!["linux", "mac"]);
    }

    #[test]
    fn test_empty_axis_is_an_error() {
        let err = MatrixExpander::expand(&matrix("python: [3.8]\ntorch: []\n")).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidMatrix(_)));
    }

    #[test]
    fn test_everything_excluded_is_an_error() {
        let result = MatrixExpander::expand(&matrix("os: [linux]\nexclude:\n  - os: linux\n"));
        assert!(result.is_err());
    }

    #[test]
    fn test_instance_limit() {
        let values: Vec<String> = (0..17).map(|i| i.to_string()).collect();
        let yaml = format!("a: [{0}]\nb: [{0}]\n", values.join(", "));
        let err = MatrixExpander::expand(&matrix(&yaml)).unwrap_err();
        assert!(err.to_string().contains("limit 256"));
    }

    #[test]
    fn test_no_strategy_runs_once() {
        let instances = MatrixExpander::expand_strategy(None).unwrap();
        assert_eq!(instances, vec![MatrixInstance::single()]);
        assert_eq!(instances[0].label("lint"), "lint");
    }

    #[test]
    fn test_instance_label() {
        let instances = MatrixExpander::expand(&matrix("python: [3.8]\ntorch: [2.0.0]\n")).unwrap();
        assert_eq!(instances[0].label("build"), "build (3.8, 2.0.0)");
        assert_eq!(instances[0].to_map().len(), 2);
    }
}
