// Expression Evaluator
// Evaluates expression ASTs against the matrix/env/github/runner contexts

use crate::expression::lexer::{segments, Segment};
use crate::expression::parser::{parse, BinaryOp, Expr};
use crate::{ServiceError, ServiceResult};

use serde_json::{Map, Value};

use std::cmp::Ordering;

/// Values visible to `${{ }}` expressions
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    pub matrix: Map<String, Value>,
    pub env: Map<String, Value>,
    pub github: Map<String, Value>,
    pub runner: Map<String, Value>,
    pub job: Map<String, Value>,
    /// Step results by step id: `{ outputs: {..}, outcome, conclusion }`
    pub steps: Map<String, Value>,
    /// Whether a previous step of the instance failed
    pub failed: bool,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matrix<'a>(mut self, values: impl IntoIterator<Item = (&'a String, &'a Value)>) -> Self {
        for (name, value) in values {
            self.matrix.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), Value::String(value.into()));
    }

    pub fn set_github(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.github.insert(name.into(), value.into());
    }

    pub fn set_runner(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.runner.insert(name.into(), value.into());
    }

    /// Record a finished step so `steps.<id>.*` resolves.
    pub fn record_step(
        &mut self,
        id: impl Into<String>,
        outputs: impl IntoIterator<Item = (String, String)>,
        outcome: &str,
    ) {
        let outputs: Map<String, Value> = outputs
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        let mut step = Map::new();
        step.insert("outputs".into(), Value::Object(outputs));
        step.insert("outcome".into(), Value::from(outcome));
        step.insert("conclusion".into(), Value::from(outcome));
        self.steps.insert(id.into(), Value::Object(step));
    }

    fn root(&self, name: &str) -> Option<Value> {
        let map = match name {
            "matrix" => &self.matrix,
            "env" => &self.env,
            "github" => &self.github,
            "runner" => &self.runner,
            "job" => &self.job,
            "steps" => &self.steps,
            _ => return None,
        };
        Some(Value::Object(map.clone()))
    }
}

/// Entry point for evaluating and interpolating expressions
pub struct ExpressionEngine;

impl ExpressionEngine {
    /// Evaluate a bare expression body (without `${{ }}`).
    pub fn evaluate(expr: &str, context: &ExpressionContext) -> ServiceResult<Value> {
        let ast = parse(expr)?;
        Evaluator { source: expr, context }.eval(&ast)
    }

    /// Replace every `${{ }}` span in `template` with its rendered value.
    pub fn interpolate(template: &str, context: &ExpressionContext) -> ServiceResult<String> {
        let mut output = String::with_capacity(template.len());
        for segment in segments(template)? {
            match segment {
                Segment::Text(text) => output.push_str(&text),
                Segment::Expression(expr) => {
                    output.push_str(&to_display(&Self::evaluate(&expr, context)?))
                }
            }
        }
        Ok(output)
    }

    /// Interpolate an action input. A string that is exactly one `${{ }}`
    /// span keeps the evaluated value's type.
    pub fn interpolate_value(value: &Value, context: &ExpressionContext) -> ServiceResult<Value> {
        match value {
            Value::String(s) => {
                let parts = segments(s)?;
                if let [Segment::Expression(expr)] = parts.as_slice() {
                    Self::evaluate(expr, context)
                } else {
                    Self::interpolate(s, context).map(Value::String)
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| Self::interpolate_value(item, context))
                .collect::<ServiceResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Self::interpolate_value(v, context)?)))
                .collect::<ServiceResult<Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Evaluate an `if:` condition. The condition may be wrapped in `${{ }}`.
    pub fn evaluate_condition(condition: &str, context: &ExpressionContext) -> ServiceResult<bool> {
        let trimmed = condition.trim();
        let body = trimmed
            .strip_prefix("${{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .unwrap_or(trimmed);
        Self::evaluate(body.trim(), context).map(|value| truthy(&value))
    }
}

struct Evaluator<'a> {
    source: &'a str,
    context: &'a ExpressionContext,
}

impl Evaluator<'_> {
    fn error(&self, message: impl Into<String>) -> ServiceError {
        ServiceError::expression(self.source, message)
    }

    fn eval(&self, expr: &Expr) -> ServiceResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Context(name) => self
                .context
                .root(name)
                .ok_or_else(|| self.error(format!("unrecognized named-value '{}'", name))),
            Expr::Property(target, name) => Ok(property(&self.eval(target)?, name)),
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                Ok(match (&target, &index) {
                    (Value::Array(items), _) => to_number(&index)
                        .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                        .and_then(|n| items.get(n as usize).cloned())
                        .unwrap_or(Value::Null),
                    _ => property(&target, &to_display(&index)),
                })
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Binary(BinaryOp::And, left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                let ordering = compare(&left, &right);
                Ok(Value::Bool(match op {
                    BinaryOp::Eq => ordering == Some(Ordering::Equal),
                    BinaryOp::Ne => ordering != Some(Ordering::Equal),
                    BinaryOp::Lt => ordering == Some(Ordering::Less),
                    BinaryOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                    BinaryOp::Gt => ordering == Some(Ordering::Greater),
                    BinaryOp::Ge => {
                        matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
                    }
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                }))
            }
            Expr::Call(name, args) => self.call(name, args),
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> ServiceResult<Value> {
        let values = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<ServiceResult<Vec<_>>>()?;

        let arity = |min: usize, max: usize| -> ServiceResult<()> {
            if values.len() < min || values.len() > max {
                Err(self.error(format!(
                    "{}() takes {}..={} arguments, got {}",
                    name,
                    min,
                    max,
                    values.len()
                )))
            } else {
                Ok(())
            }
        };

        match name.to_ascii_lowercase().as_str() {
            "success" => {
                arity(0, 0)?;
                Ok(Value::Bool(!self.context.failed))
            }
            "failure" => {
                arity(0, 0)?;
                Ok(Value::Bool(self.context.failed))
            }
            "always" => {
                arity(0, 0)?;
                Ok(Value::Bool(true))
            }
            "cancelled" => {
                arity(0, 0)?;
                Ok(Value::Bool(false))
            }
            "contains" => {
                arity(2, 2)?;
                Ok(Value::Bool(match &values[0] {
                    Value::Array(items) => items
                        .iter()
                        .any(|item| compare(item, &values[1]) == Some(Ordering::Equal)),
                    haystack => to_display(haystack)
                        .to_lowercase()
                        .contains(&to_display(&values[1]).to_lowercase()),
                }))
            }
            "startswith" => {
                arity(2, 2)?;
                Ok(Value::Bool(
                    to_display(&values[0])
                        .to_lowercase()
                        .starts_with(&to_display(&values[1]).to_lowercase()),
                ))
            }
            "endswith" => {
                arity(2, 2)?;
                Ok(Value::Bool(
                    to_display(&values[0])
                        .to_lowercase()
                        .ends_with(&to_display(&values[1]).to_lowercase()),
                ))
            }
            "format" => {
                arity(1, usize::MAX)?;
                self.format(&to_display(&values[0]), &values[1..])
                    .map(Value::String)
            }
            "join" => {
                arity(1, 2)?;
                let separator = values.get(1).map(to_display).unwrap_or_else(|| ",".into());
                Ok(Value::String(match &values[0] {
                    Value::Array(items) => items
                        .iter()
                        .map(to_display)
                        .collect::<Vec<_>>()
                        .join(&separator),
                    other => to_display(other),
                }))
            }
            "tojson" => {
                arity(1, 1)?;
                serde_json::to_string_pretty(&values[0])
                    .map(Value::String)
                    .map_err(|e| self.error(e.to_string()))
            }
            "fromjson" => {
                arity(1, 1)?;
                serde_json::from_str(&to_display(&values[0])).map_err(|e| self.error(e.to_string()))
            }
            _ => Err(self.error(format!("unknown function '{}'", name))),
        }
    }

    fn format(&self, template: &str, args: &[Value]) -> ServiceResult<String> {
        let chars: Vec<char> = template.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '{' if chars.get(i + 1) == Some(&'{') => {
                    out.push('{');
                    i += 2;
                }
                '}' if chars.get(i + 1) == Some(&'}') => {
                    out.push('}');
                    i += 2;
                }
                '{' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == '}')
                        .ok_or_else(|| self.error("format(): unclosed '{'"))?;
                    let index: String = chars[i + 1..i + close].iter().collect();
                    let arg = index
                        .parse::<usize>()
                        .ok()
                        .and_then(|n| args.get(n))
                        .ok_or_else(|| self.error(format!("format(): bad index '{}'", index)))?;
                    out.push_str(&to_display(arg));
                    i += close + 1;
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Ok(out)
    }
}

/// Property access; keys are matched case-insensitively as a fallback.
fn property(target: &Value, name: &str) -> Value {
    match target {
        Value::Object(map) => map
            .get(name)
            .or_else(|| {
                map.iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value the way it appears when substituted into text.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Loose comparison: same-typed strings compare case-insensitively,
/// mismatched scalars are coerced to numbers.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        (Value::Array(_), _) | (Value::Object(_), _) | (_, Value::Array(_)) | (_, Value::Object(_)) => {
            (left == right).then_some(Ordering::Equal)
        }
        _ => {
            let a = to_number(left)?;
            let b = to_number(right)?;
            a.partial_cmp(&b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExpressionContext {
        let mut ctx = ExpressionContext::new();
        ctx.matrix.insert("python".into(), serde_json::json!(3.8));
        ctx.matrix.insert("torch".into(), Value::from("2.0.0"));
        ctx.set_env("CI", "true");
        ctx.set_github("ref", "refs/heads/master");
        ctx.set_github("event_name", "push");
        ctx.set_runner("os", "Linux");
        ctx
    }

    #[test]
    fn test_interpolate_matrix_values() {
        let ctx = context();
        let rendered = ExpressionEngine::interpolate(
            "pip install torch==${{ matrix.torch }}+cpu  # py${{ matrix.python }}",
            &ctx,
        )
        .unwrap();
        assert_eq!(rendered, "pip install torch==2.0.0+cpu  # py3.8");
    }

    #[test]
    fn test_missing_property_renders_empty() {
        let ctx = context();
        assert_eq!(
            ExpressionEngine::interpolate("[${{ matrix.missing }}]", &ctx).unwrap(),
            "[]"
        );
    }

    #[test]
    fn test_unknown_context_is_an_error() {
        let ctx = context();
        let err = ExpressionEngine::interpolate("${{ secrets.TOKEN }}", &ctx).unwrap_err();
        assert!(err.to_string().contains("unrecognized named-value 'secrets'"));
    }

    #[test]
    fn test_interpolate_value_keeps_type() {
        let ctx = context();
        let value = ExpressionEngine::interpolate_value(&Value::from("${{ matrix.python }}"), &ctx)
            .unwrap();
        assert_eq!(value, serde_json::json!(3.8));

        let mixed =
            ExpressionEngine::interpolate_value(&Value::from("v${{ matrix.python }}"), &ctx)
                .unwrap();
        assert_eq!(mixed, Value::from("v3.8"));
    }

    #[test]
    fn test_comparisons_and_logic() {
        let ctx = context();
        let eval = |e: &str| ExpressionEngine::evaluate(e, &ctx).unwrap();

        assert_eq!(eval("github.ref == 'REFS/HEADS/MASTER'"), Value::Bool(true));
        assert_eq!(eval("matrix.python >= 3.8"), Value::Bool(true));
        assert_eq!(eval("matrix.torch != '1.10.0'"), Value::Bool(true));
        assert_eq!(eval("matrix.missing || 'fallback'"), Value::from("fallback"));
        assert_eq!(eval("env.CI && 'yes'"), Value::from("yes"));
        assert_eq!(eval("!(runner.os == 'Linux')"), Value::Bool(false));
        assert_eq!(eval("matrix['torch']"), Value::from("2.0.0"));
    }

    #[test]
    fn test_functions() {
        let ctx = context();
        let eval = |e: &str| ExpressionEngine::evaluate(e, &ctx).unwrap();

        assert_eq!(eval("contains(github.ref, 'master')"), Value::Bool(true));
        assert_eq!(eval("startsWith(github.ref, 'refs/heads/')"), Value::Bool(true));
        assert_eq!(eval("endsWith(matrix.torch, '.0')"), Value::Bool(true));
        assert_eq!(
            eval("format('{0}-{1} {{x}}', matrix.python, matrix.torch)"),
            Value::from("3.8-2.0.0 {x}")
        );
        assert_eq!(eval("join(fromJSON('[1,2,3]'), '+')"), Value::from("1+2+3"));
        assert_eq!(eval("contains(fromJSON('[\"a\",\"b\"]'), 'B')"), Value::Bool(true));
        assert_eq!(eval("success() && !failure() && always()"), Value::Bool(true));
    }

    #[test]
    fn test_function_errors() {
        let ctx = context();
        assert!(ExpressionEngine::evaluate("nope()", &ctx).is_err());
        assert!(ExpressionEngine::evaluate("contains('a')", &ctx).is_err());
        assert!(ExpressionEngine::evaluate("format('{3}', 'a')", &ctx).is_err());
    }

    #[test]
    fn test_conditions() {
        let mut ctx = context();
        assert!(ExpressionEngine::evaluate_condition("${{ github.event_name == 'push' }}", &ctx)
            .unwrap());
        assert!(!ExpressionEngine::evaluate_condition("matrix.torch == '1.10.0'", &ctx).unwrap());

        ctx.failed = true;
        assert!(ExpressionEngine::evaluate_condition("failure()", &ctx).unwrap());
    }

    #[test]
    fn test_step_outputs() {
        let mut ctx = context();
        ctx.record_step(
            "setup",
            vec![("python-version".to_string(), "3.8.18".to_string())],
            "success",
        );
        assert_eq!(
            ExpressionEngine::interpolate("${{ steps.setup.outputs.python-version }}", &ctx)
                .unwrap(),
            "3.8.18"
        );
        assert_eq!(
            ExpressionEngine::evaluate("steps.setup.outcome", &ctx).unwrap(),
            Value::from("success")
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(to_display(&Value::Null), "");
        assert_eq!(to_display(&serde_json::json!(2.0)), "2");
        assert_eq!(to_display(&serde_json::json!(3.8)), "3.8");
        assert_eq!(to_display(&Value::from(18)), "18");
        assert!(truthy(&Value::from("x")));
        assert!(!truthy(&Value::from(0)));
    }
}
