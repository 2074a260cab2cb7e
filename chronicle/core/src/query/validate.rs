//! Expression validation
//!
//! Two checks, both required:
//!
//! 1. **Denylist**: identifiers and variables that reach outside the
//!    document (input streams, environment, modules, process control), plus
//!    path-traversal text anywhere in the expression.
//! 2. **Syntax**: the expression must compile, then it is run against an
//!    object-shaped and an array-shaped dummy. It passes if either run
//!    succeeds. When both fail the object-shape error is reported.
//!
//! Dummy runs are bounded by an output count and a wall-clock budget. Hitting
//! the output count counts as a success; outlasting the budget is a rejection.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::engine::{CompiledQuery, Interrupt, RunEnd};
use super::lexer::{tokenize, TokenKind};

/// Identifiers rejected when used as filters (not as `.field` names)
pub const DENIED_IDENTIFIERS: &[&str] = &[
    "input",
    "inputs",
    "debug",
    "stderr",
    "input_filename",
    "input_line_number",
    "halt",
    "halt_error",
    "env",
    "import",
    "include",
    "modulemeta",
    "get_search_list",
    "system",
    "exec",
    "getpath_unsafe",
];

/// Variables rejected anywhere outside string literals
pub const DENIED_VARIABLES: &[&str] = &["$ENV", "$__loc__", "$__prog_args"];

/// Text rejected anywhere, string literals included
pub const DENIED_SUBSTRINGS: &[&str] = &["../", "..\\", "~/"];

/// Outputs pulled from each dummy run before it counts as a success
const DUMMY_OUTPUT_BUDGET: usize = 64;

/// Check the denylist
///
/// Returns the reason for rejection.
pub(crate) fn check_denylist(expression: &str) -> Result<(), String> {
    if let Some(found) = DENIED_SUBSTRINGS.iter().find(|s| expression.contains(**s)) {
        return Err(format!("path traversal token {found:?} is not allowed"));
    }

    for token in tokenize(expression) {
        match &token.kind {
            TokenKind::Ident(name) => {
                // Namespaced calls (`lib::f`) imply a module import
                if name.contains("::") {
                    return Err(format!("module reference {name:?} is not allowed"));
                }
                if DENIED_IDENTIFIERS.contains(&name.as_str()) {
                    return Err(format!("{name:?} is not allowed"));
                }
            }
            TokenKind::Var(var) if DENIED_VARIABLES.contains(&var.as_str()) => {
                return Err(format!("{var} is not allowed"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Outcome of one dummy run
#[derive(Debug)]
enum DummyRun {
    Passed,
    Failed(String),
    Overran,
}

/// Compile and run against both dummy shapes
///
/// Blocking; call from a blocking thread.
pub(crate) fn check_syntax(expression: &str, budget: Duration) -> Result<(), String> {
    let query = CompiledQuery::compile(expression)?;
    let deadline = Instant::now() + budget;

    let object = json!({});
    let on_object = match dummy_run(&query, object.clone(), deadline) {
        DummyRun::Passed => return Ok(()),
        DummyRun::Overran => return Err(overrun(budget)),
        DummyRun::Failed(message) => message,
    };
    match dummy_run(&query, json!([]), deadline) {
        DummyRun::Passed => Ok(()),
        DummyRun::Overran => Err(overrun(budget)),
        DummyRun::Failed(_) => Err(format!(
            "expression fails against {} input: {on_object}",
            shape_name(&object)
        )),
    }
}

fn overrun(budget: Duration) -> String {
    format!(
        "expression did not finish within the {}ms validation limit",
        budget.as_millis()
    )
}

fn dummy_run(query: &CompiledQuery, input: Value, deadline: Instant) -> DummyRun {
    let interrupt = Interrupt::default().with_deadline(deadline);
    let mut outputs = 0usize;
    let result = query.run(input, &interrupt, |_| {
        outputs += 1;
        if outputs >= DUMMY_OUTPUT_BUDGET {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    match result {
        Ok(RunEnd::Cancelled) => DummyRun::Overran,
        Ok(_) => DummyRun::Passed,
        Err(message) => DummyRun::Failed(message),
    }
}

/// Human name for the shape of a JSON value
pub(crate) fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array-shaped",
        Value::Object(_) => "object-shaped",
    }
}
