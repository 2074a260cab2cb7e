//! jaq adapter
//!
//! The only place that touches the jq engine. jaq values and filters are not
//! `Send`, so a [`CompiledQuery`] is built and run on one blocking thread and
//! never crosses an `.await`.
//!
//! # Interrupts
//!
//! A run checks its [`Interrupt`] between outputs. Generators that can spin
//! without producing anything (`range`, `repeat`, `while`, `until`,
//! `recurse`) are replaced by versions that also check it on every step, so
//! `last(range(1e12))` stops at the deadline instead of pinning its thread.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use jaq_interpret::results::then;
use jaq_interpret::{Args, Ctx, Error, Filter, FilterT, Native, ParseCtx, RcIter, Val, ValR};
use serde_json::Value;

/// Step-checked generators, shadowing the standard library for user code
///
/// `range/3` is native, so `range/1` and `range/2` from the standard library
/// already reach the checked version.
const CHECKED_DEFS: &str = r#"
def repeat(f): def rec: f, (_checkpoint | rec); rec;
def recurse(f): def rec: ., (f | _checkpoint | rec); rec;
def recurse(f; cond): recurse(f | select(cond));
def recurse: recurse(.[]?);
def while(cond; update):
  def rec: if cond then ., (update | _checkpoint | rec) else empty end; rec;
def until(cond; update):
  def rec: if cond then . else update | _checkpoint | rec end; rec;
"#;

const INTERRUPTED: &str = "evaluation interrupted";

thread_local! {
    static ACTIVE: RefCell<Option<Interrupt>> = const { RefCell::new(None) };
}

/// Stop conditions for one run: a shared cancel flag and an optional deadline
#[derive(Debug, Clone, Default)]
pub(crate) struct Interrupt {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Interrupt {
    pub(crate) fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    #[must_use]
    pub(crate) fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether the deadline, rather than the cancel flag, ended the run
    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Makes an interrupt visible to the checked generators on this thread
struct Installed;

impl Installed {
    fn new(interrupt: &Interrupt) -> Self {
        ACTIVE.with(|active| *active.borrow_mut() = Some(interrupt.clone()));
        Self
    }
}

impl Drop for Installed {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.borrow_mut().take());
    }
}

fn checkpoint() -> Result<(), Error> {
    ACTIVE.with(|active| match active.borrow().as_ref() {
        Some(interrupt) if interrupt.is_raised() => Err(Error::str(INTERRUPTED)),
        _ => Ok(()),
    })
}

type Outputs<'a> = Box<dyn Iterator<Item = ValR> + 'a>;

fn checkpoint_native<'a>(_: Args<'a, Val>, cv: (Ctx<'a, Val>, Val)) -> Outputs<'a> {
    Box::new(std::iter::once(checkpoint().map(|()| cv.1)))
}

fn range_native<'a>(args: Args<'a, Val>, cv: (Ctx<'a, Val>, Val)) -> Outputs<'a> {
    let (from, upto, by) = (args.get(0), args.get(1), args.get(2));
    Box::new(from.cartesian3(upto, by, cv).flat_map(|(from, upto, by)| {
        let upto_by = upto.and_then(|upto| Ok((upto, by?)));
        then(upto_by, |(upto, by)| Box::new(steps(from, upto, by)))
    }))
}

/// `from`, `from + by`, ... while short of `upto`, checking the interrupt
/// before each value
fn steps(mut next: ValR, upto: Val, by: Val) -> impl Iterator<Item = ValR> {
    use std::cmp::Ordering::{Equal, Greater, Less};

    let direction = by.partial_cmp(&Val::Int(0)).unwrap_or(Equal);
    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        let current = match checkpoint().and_then(|()| next.clone()) {
            Ok(current) => current,
            Err(err) => {
                done = true;
                return Some(Err(err));
            }
        };
        let more = match direction {
            Greater => current < upto,
            Less => current > upto,
            Equal => current != upto,
        };
        if !more {
            return None;
        }
        next = current.clone() + by.clone();
        Some(Ok(current))
    })
}

fn checked_natives() -> [(String, usize, Native); 2] {
    [
        ("_checkpoint".to_string(), 0, Native::new(checkpoint_native)),
        ("range".to_string(), 3, Native::new(range_native)),
    ]
}

/// A compiled jq expression
pub(crate) struct CompiledQuery {
    expression: String,
    filter: Filter,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEnd {
    /// Every output was produced
    Exhausted,
    /// The output callback asked to stop
    Stopped,
    /// The interrupt was raised
    Cancelled,
}

impl CompiledQuery {
    /// Lex, parse and compile `expression` with the jq standard library
    ///
    /// An empty expression compiles as identity.
    pub(crate) fn compile(expression: &str) -> Result<Self, String> {
        let normalized = if expression.trim().is_empty() {
            ".".to_string()
        } else {
            expression.trim().to_string()
        };

        let tokens = jaq_syn::Lexer::new(&normalized)
            .lex()
            .map_err(|errs| format!("lex error: {errs:?}"))?;
        let main = jaq_syn::Parser::new(&tokens)
            .parse(|parser| parser.module(|module| module.term()))
            .map_err(|errs| format!("parse error: {errs:?}"))?
            .conv(&normalized);

        let checked = jaq_syn::parse(CHECKED_DEFS, |parser| parser.module(|m| m.defs()))
            .ok_or_else(|| "checked generator definitions failed to parse".to_string())?
            .conv(CHECKED_DEFS);

        // Natives resolve first match, definitions last match
        let mut ctx = ParseCtx::new(Vec::new());
        ctx.insert_natives(checked_natives());
        ctx.insert_natives(jaq_core::core());
        ctx.insert_defs(jaq_std::std());
        ctx.insert_defs(checked);
        let filter = ctx.compile(main);
        if !ctx.errs.is_empty() {
            let errors = ctx
                .errs
                .into_iter()
                .map(|err| err.0.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(format!("compile error: {errors}"));
        }

        Ok(Self {
            expression: normalized,
            filter,
        })
    }

    /// Run against `input`, handing each output to `emit`
    ///
    /// The first evaluation error ends the run. `interrupt` is checked before
    /// each output is pulled and on every step of the checked generators; an
    /// error raised by an interrupted step ends the run as `Cancelled`.
    pub(crate) fn run<F>(
        &self,
        input: Value,
        interrupt: &Interrupt,
        mut emit: F,
    ) -> Result<RunEnd, String>
    where
        F: FnMut(Value) -> ControlFlow<()>,
    {
        let _installed = Installed::new(interrupt);
        let inputs = RcIter::new(core::iter::empty());
        let mut outputs = self.filter.run((Ctx::new([], &inputs), Val::from(input)));
        loop {
            if interrupt.is_raised() {
                return Ok(self.interrupted(interrupt));
            }
            let value = match outputs.next() {
                // An interrupted step may have been swallowed by `?` or `try`
                _ if interrupt.is_raised() => return Ok(self.interrupted(interrupt)),
                None => return Ok(RunEnd::Exhausted),
                Some(Ok(value)) => value,
                Some(Err(err)) => return Err(err.to_string()),
            };
            if emit(Value::from(value)).is_break() {
                return Ok(RunEnd::Stopped);
            }
        }
    }

    fn interrupted(&self, interrupt: &Interrupt) -> RunEnd {
        tracing::debug!(
            expression = %self.expression,
            deadline = interrupt.deadline_passed(),
            "Evaluation interrupted"
        );
        RunEnd::Cancelled
    }

    /// Run to completion, collecting at most `limit` outputs
    pub(crate) fn collect(
        &self,
        input: Value,
        interrupt: &Interrupt,
        limit: Option<usize>,
    ) -> Result<(Vec<Value>, RunEnd), String> {
        let mut values = Vec::new();
        let end = self.run(input, interrupt, |value| {
            values.push(value);
            if limit.is_some_and(|l| values.len() >= l) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok((values, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn run_all(expr: &str, input: Value) -> Result<Vec<Value>, String> {
        let query = CompiledQuery::compile(expr)?;
        query
            .collect(input, &Interrupt::default(), None)
            .map(|(values, _)| values)
    }

    fn soon() -> Interrupt {
        Interrupt::default().with_deadline(Instant::now() + Duration::from_millis(100))
    }

    #[test]
    fn test_empty_expression_is_identity() {
        let query = CompiledQuery::compile("   ").unwrap();
        assert_eq!(query.expression, ".");
        assert_eq!(run_all("", json!({"a": 1})).unwrap(), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_zero_one_many_outputs() {
        assert!(run_all("select(.a == 2)", json!({"a": 1})).unwrap().is_empty());
        assert_eq!(run_all(".b", json!({"a": 1})).unwrap(), vec![Value::Null]);
        assert_eq!(
            run_all(".[]", json!([1, 2, 3])).unwrap(),
            vec![json!(1), json!(2), json!(3)]
        );
    }

    #[test]
    fn test_compile_error() {
        assert!(CompiledQuery::compile(".[[[").is_err());
        assert!(CompiledQuery::compile("no_such_function(1)").is_err());
    }

    #[test]
    fn test_evaluation_error() {
        assert!(run_all(".a", json!([1])).is_err());
    }

    #[test]
    fn test_checked_generators_keep_their_results() {
        assert_eq!(run_all("[range(3)]", Value::Null).unwrap(), vec![json!([0, 1, 2])]);
        assert_eq!(
            run_all("[range(1; 10; 4)]", Value::Null).unwrap(),
            vec![json!([1, 5, 9])]
        );
        assert_eq!(
            run_all("[range(3; 0; -1)]", Value::Null).unwrap(),
            vec![json!([3, 2, 1])]
        );
        assert_eq!(
            run_all("[range(0, 1; 2)]", Value::Null).unwrap(),
            vec![json!([0, 1, 1])]
        );
        assert_eq!(
            run_all("[.[] | while(. < 8; . * 2)]", json!([1])).unwrap(),
            vec![json!([1, 2, 4])]
        );
        assert_eq!(run_all("until(. > 4; . + 3)", json!(0)).unwrap(), vec![json!(6)]);
        assert_eq!(
            run_all("[limit(3; repeat(1))]", Value::Null).unwrap(),
            vec![json!([1, 1, 1])]
        );
        assert_eq!(
            run_all("[recurse(if . < 2 then . + 1 else empty end)]", json!(0)).unwrap(),
            vec![json!([0, 1, 2])]
        );
        assert_eq!(
            run_all("[recurse | numbers]", json!({"a": [1, {"b": 2}]})).unwrap(),
            vec![json!([1, 2])]
        );
    }

    #[test]
    fn test_deadline_stops_silent_generators() {
        for expr in [
            "last(range(1e12))",
            "[range(0; 1e12; 1)] | length",
            "last(repeat(1))",
            "last(0 | while(true; . + 1))",
            "0 | until(false; . + 1)",
            "last(0 | recurse(. + 1))",
        ] {
            let query = CompiledQuery::compile(expr).unwrap();
            let started = Instant::now();
            let (values, end) = query.collect(Value::Null, &soon(), None).unwrap();
            assert_eq!(end, RunEnd::Cancelled, "{expr}");
            assert!(values.is_empty(), "{expr}");
            assert!(started.elapsed() < Duration::from_secs(5), "{expr} overran");
        }
    }

    #[test]
    fn test_interrupted_step_is_not_caught() {
        let query = CompiledQuery::compile("[range(1e12)?] | length").unwrap();
        let (values, end) = query.collect(Value::Null, &soon(), None).unwrap();
        assert_eq!(end, RunEnd::Cancelled);
        assert!(values.is_empty());
    }

    #[test]
    fn test_limit_and_cancel() {
        let query = CompiledQuery::compile("range(0; 100)").unwrap();
        let (values, end) = query
            .collect(Value::Null, &Interrupt::default(), Some(3))
            .unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(end, RunEnd::Stopped);

        let cancelled = Interrupt::new(Arc::new(AtomicBool::new(true)));
        let (values, end) = query.collect(Value::Null, &cancelled, None).unwrap();
        assert!(values.is_empty());
        assert_eq!(end, RunEnd::Cancelled);
    }
}
