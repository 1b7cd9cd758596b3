//! Generators and loop continuations (spec.md §4.6)
//!
//! Iterator commands (`each`, `pair`, `range`, `rng`, `for`, `while`,
//! `repeat`, `fizz`) and user `yield` points are both driven by a
//! `LoopContinuation`: a resumable cursor over a sequence plus the loop's
//! own parsed body and the index into it a `yield` left off at. Entering a
//! nested loop pushes the enclosing one onto `parent`; leaving it pops
//! back, so `break 2`/`continue 2` (spec.md §4.3) can walk the chain by
//! level count, and so a `yield` raised from inside a nested loop call can
//! be resumed back into the exact enclosing iteration it interrupted.

use crate::parser::ParsedCommand;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum IterKind {
    Each(Vec<Value>),
    Pair(Vec<(Value, Value)>),
    Range { end: i64, step: i64 },
    Rng { end: i64, step: i64 },
    /// `while (cond), (body)` -- re-evaluates `cond` before every
    /// iteration; driven externally since it needs the executor, not by
    /// `advance()`.
    While { cond: Vec<ParsedCommand> },
    /// `for <generator-token>, var, (body)` -- each iteration resumes the
    /// inner generator token; driven externally since resuming needs the
    /// runtime's token system, not just `advance()`.
    GeneratorToken { token: u64 },
}

/// How a loop binds its per-iteration value(s) into scope: a plain `var`,
/// `(a, b)` destructuring unpack of a list item, or no binding at all
/// (`repeat`, which just runs its body n times).
#[derive(Debug, Clone)]
pub enum VarBinding {
    Single(String),
    Unpack(Vec<String>),
    Ignore,
}

/// What one `advance()` call yields: either nothing left, a single bound
/// value, or a key/value pair (`pair` iterates `(key, value)` tuples).
pub enum Step {
    Done,
    Value(Value),
    Pair(Value, Value),
}

#[derive(Debug, Clone)]
pub struct LoopContinuation {
    pub iter: IterKind,
    pub cursor: i64,
    pub var: VarBinding,
    pub pair: bool,
    /// This loop's body, parsed once up front.
    pub body: Vec<ParsedCommand>,
    /// Index into `body` to resume from -- 0 at the start of an iteration,
    /// greater than 0 only when resuming mid-body after a `yield`.
    pub body_index: usize,
    /// 1-based count of the iteration currently running.
    pub iteration: i64,
    /// `repeat` collects each iteration's result (and which ones failed)
    /// into its returned list; other loop kinds leave this `false`.
    pub collect: bool,
    pub collected: Vec<Value>,
    /// 1-based iteration numbers whose result was a failing status.
    pub failures: Vec<i64>,
    pub parent: Option<Box<LoopContinuation>>,
}

impl LoopContinuation {
    fn new(iter: IterKind, cursor: i64, var: VarBinding, pair: bool, body: Vec<ParsedCommand>, collect: bool) -> Self {
        Self { iter, cursor, var, pair, body, body_index: 0, iteration: 0, collect, collected: Vec::new(), failures: Vec::new(), parent: None }
    }

    pub fn each(items: Vec<Value>, var: VarBinding, body: Vec<ParsedCommand>) -> Self {
        Self::new(IterKind::Each(items), 0, var, false, body, false)
    }

    pub fn pair(items: Vec<(Value, Value)>, var: VarBinding, body: Vec<ParsedCommand>) -> Self {
        Self::new(IterKind::Pair(items), 0, var, true, body, false)
    }

    pub fn range(start: i64, end: i64, step: i64, var: VarBinding, body: Vec<ParsedCommand>) -> Self {
        Self::new(IterKind::Range { end, step }, start, var, false, body, false)
    }

    pub fn rng(start: i64, end: i64, step: i64, var: VarBinding, body: Vec<ParsedCommand>) -> Self {
        Self::new(IterKind::Rng { end, step }, start, var, false, body, false)
    }

    /// `repeat n, (body)` -- counts n iterations without binding a
    /// variable, collecting each iteration's result (and failures).
    pub fn repeat(n: i64, body: Vec<ParsedCommand>) -> Self {
        Self::new(IterKind::Range { end: n, step: 1 }, 0, VarBinding::Ignore, false, body, true)
    }

    pub fn while_loop(cond: Vec<ParsedCommand>, body: Vec<ParsedCommand>) -> Self {
        Self::new(IterKind::While { cond }, 0, VarBinding::Ignore, false, body, false)
    }

    pub fn generator_token(token: u64, var: VarBinding, body: Vec<ParsedCommand>) -> Self {
        Self::new(IterKind::GeneratorToken { token }, 0, var, false, body, false)
    }

    /// Nest `self` under a new current continuation, returning the new
    /// top of the chain.
    pub fn nest(self, inner: LoopContinuation) -> LoopContinuation {
        let mut inner = inner;
        inner.parent = Some(Box::new(self));
        inner
    }

    /// Pop back to the enclosing loop, if any.
    pub fn unnest(self) -> Option<LoopContinuation> {
        self.parent.map(|p| *p)
    }

    /// Advance the synchronous iterator kinds (`each`/`pair`/numeric
    /// range/rng/repeat's counter). `while`/`generator-token` are driven
    /// externally by the loop builtin since they need runtime access.
    pub fn advance(&mut self) -> Step {
        match &self.iter {
            IterKind::Each(items) => {
                let idx = self.cursor as usize;
                if idx >= items.len() {
                    return Step::Done;
                }
                let v = items[idx].clone();
                self.cursor += 1;
                Step::Value(v)
            }
            IterKind::Pair(items) => {
                let idx = self.cursor as usize;
                if idx >= items.len() {
                    return Step::Done;
                }
                let (k, v) = items[idx].clone();
                self.cursor += 1;
                Step::Pair(k, v)
            }
            IterKind::Range { end, step } | IterKind::Rng { end, step } => {
                let done = if *step > 0 { self.cursor >= *end } else { self.cursor <= *end };
                if done {
                    return Step::Done;
                }
                let v = Value::Int(self.cursor);
                self.cursor += step;
                Step::Value(v)
            }
            IterKind::While { .. } | IterKind::GeneratorToken { .. } => Step::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_advances_then_is_done() {
        let mut lc = LoopContinuation::each(vec![Value::Int(1), Value::Int(2)], VarBinding::Single("x".into()), Vec::new());
        assert!(matches!(lc.advance(), Step::Value(Value::Int(1))));
        assert!(matches!(lc.advance(), Step::Value(Value::Int(2))));
        assert!(matches!(lc.advance(), Step::Done));
    }

    #[test]
    fn range_respects_negative_step() {
        let mut lc = LoopContinuation::range(3, 0, -1, VarBinding::Single("i".into()), Vec::new());
        let mut seen = Vec::new();
        loop {
            match lc.advance() {
                Step::Value(Value::Int(n)) => seen.push(n),
                Step::Done => break,
                _ => unreachable!(),
            }
        }
        assert_eq!(seen, vec![3, 2, 1]);
    }

    #[test]
    fn nest_and_unnest_restores_outer_loop() {
        let outer = LoopContinuation::each(vec![Value::Int(1)], VarBinding::Single("o".into()), Vec::new());
        let inner = LoopContinuation::each(vec![Value::Int(2)], VarBinding::Single("i".into()), Vec::new());
        let nested = outer.nest(inner);
        assert!(matches!(&nested.var, VarBinding::Single(n) if n == "i"));
        let restored = nested.unnest().unwrap();
        assert!(matches!(&restored.var, VarBinding::Single(n) if n == "o"));
    }
}
