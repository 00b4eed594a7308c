//! Step pre-conditions.
//!
//! A condition is a small expression evaluated against the job context and
//! the node's environment:
//!
//! - `${{ NAME }}` and `${{ env.NAME }}` stand for the variable value
//!   (empty when unset); a lone placeholder may hold `true` or `false`
//! - `true`, `false`
//! - `a == b`, `a != b`, `a contains b`
//! - `&&` and `||` to combine the above (`&&` binds tighter)
//!
//! Anything else is rejected, which skips the step.

use flowci_core::vars::Vars;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").unwrap());

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("unrecognized condition expression '{0}'")]
    Unrecognized(String),
    #[error("condition timed out after {0:?}")]
    Timeout(Duration),
    #[error("condition evaluation aborted: {0}")]
    Aborted(String),
}

/// Evaluates conditions off the async runtime with a wall-clock limit.
#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    timeout: Duration,
}

impl ConditionEvaluator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn evaluate(&self, condition: &str, vars: &Vars) -> Result<bool, ConditionError> {
        let condition = condition.to_string();
        let vars = vars.clone();
        let task = tokio::task::spawn_blocking(move || evaluate(&condition, &vars));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ConditionError::Aborted(e.to_string())),
            Err(_) => Err(ConditionError::Timeout(self.timeout)),
        }
    }
}

/// Evaluate `condition` synchronously.
///
/// Operators are found before any variable is resolved, so a value is
/// always compared as a whole whatever text it holds.
pub fn evaluate(condition: &str, vars: &Vars) -> Result<bool, ConditionError> {
    let (masked, names) = mask(condition);
    let resolve = |operand: &str| unmask(operand, &names, vars);

    for alternative in masked.split("||") {
        let mut all = true;
        for term in alternative.split("&&") {
            if !evaluate_term(term, &resolve)? {
                all = false;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

const MARK: char = '\u{0}';

/// Replace every placeholder with `MARK index MARK` and collect the names.
fn mask(input: &str) -> (String, Vec<String>) {
    let mut names = Vec::new();
    let masked = PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures| {
            let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
            names.push(expr.strip_prefix("env.").unwrap_or(expr).to_string());
            format!("{MARK}{}{MARK}", names.len() - 1)
        })
        .into_owned();
    (masked, names)
}

/// Put the variable values back into a masked operand. Unset is empty.
fn unmask(operand: &str, names: &[String], vars: &Vars) -> String {
    let mut resolved = String::with_capacity(operand.len());
    for (i, part) in operand.split(MARK).enumerate() {
        if i % 2 == 0 {
            resolved.push_str(part);
            continue;
        }
        let value = part
            .parse::<usize>()
            .ok()
            .and_then(|n| names.get(n))
            .and_then(|name| vars.get(name));
        resolved.push_str(value.map_or("", String::as_str));
    }
    resolved
}

fn evaluate_term(
    term: &str,
    resolve: &impl Fn(&str) -> String,
) -> Result<bool, ConditionError> {
    let trimmed = term.trim();
    let operand = |value: &str| resolve(unquote(value));

    if let Some((left, right)) = trimmed.split_once("!=") {
        return Ok(operand(left) != operand(right));
    }
    if let Some((left, right)) = trimmed.split_once("==") {
        return Ok(operand(left) == operand(right));
    }
    if let Some((left, right)) = trimmed.split_once(" contains ") {
        return Ok(operand(left).contains(&operand(right)));
    }

    match resolve(trimmed).trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConditionError::Unrecognized(other.to_string())),
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}
