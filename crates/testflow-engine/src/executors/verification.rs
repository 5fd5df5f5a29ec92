use minijinja::{context, Environment};
use regex::Regex;
use serde_json::{json, Value};

use testflow_core::error::{FlowError, Result};
use testflow_core::flow::{AssertionType, VerificationConfig};

use crate::context::ContextView;

/// Compare an upstream output against the expected value.
///
/// The candidate is the output of `source` when set, otherwise the most
/// recently captured output among this node's direct dependencies (or of
/// the whole run for a node without any). `path` narrows it with a JSON pointer; a
/// pointer that resolves to nothing yields `null`.
pub fn execute(node_id: &str, config: &VerificationConfig, view: &ContextView) -> Result<Value> {
    let output = match config.source.as_deref() {
        Some(source) => view.output(source).ok_or_else(|| {
            FlowError::Execution(format!("no output captured for source node '{}'", source))
        })?,
        None => {
            view.upstream_output()
                .ok_or_else(|| FlowError::Execution("no upstream output to verify".to_string()))?
                .1
        }
    };

    let actual = match config.path.as_deref() {
        Some(pointer) if !pointer.is_empty() => output.pointer(pointer).cloned().unwrap_or(Value::Null),
        _ => output.clone(),
    };

    let expected = match (&config.expected, config.assertion_type) {
        (Some(v), _) => v.clone(),
        (None, AssertionType::Custom) => Value::Null,
        (None, _) => {
            return Err(FlowError::invalid_config(node_id, "expected value is required"));
        }
    };

    let passed = match config.assertion_type {
        AssertionType::Equals => actual == expected,
        AssertionType::Contains => contains(&actual, &expected),
        AssertionType::Regex => matches_pattern(node_id, &actual, &expected)?,
        AssertionType::Custom => {
            run_script(node_id, config.script.as_deref(), &actual, &expected, view)?
        }
    };

    if !passed {
        return Err(FlowError::AssertionFailed { expected, actual });
    }

    Ok(json!({ "passed": true, "expected": expected, "actual": actual }))
}

/// Strings are compared raw, anything else by its JSON text.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    as_text(actual).contains(&as_text(expected))
}

fn matches_pattern(node_id: &str, actual: &Value, expected: &Value) -> Result<bool> {
    let Value::String(pattern) = expected else {
        return Err(FlowError::invalid_config(node_id, "regex assertion expects a string pattern"));
    };
    let re = Regex::new(pattern)
        .map_err(|e| FlowError::invalid_config(node_id, format!("invalid regex: {}", e)))?;
    Ok(re.is_match(&as_text(actual)))
}

fn run_script(
    node_id: &str,
    script: Option<&str>,
    actual: &Value,
    expected: &Value,
    view: &ContextView,
) -> Result<bool> {
    let script = script
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FlowError::invalid_config(node_id, "custom assertion requires a script"))?;

    let env = Environment::new();
    let expr = env
        .compile_expression(script)
        .map_err(|e| FlowError::Execution(format!("script error: {}", e)))?;
    let result = expr
        .eval(context! {
            actual => actual,
            expected => expected,
            nodes => view.outputs_json(),
        })
        .map_err(|e| FlowError::Execution(format!("script error: {}", e)))?;
    Ok(result.is_true())
}
