//! Substitution engine (spec.md §4.2)
//!
//! Recognizes `$N`/`$@`/`$*` (positional macro args), `~name` (scope-chain
//! variable lookup), `#name` (objects-registry lookup), and `{expr}`
//! (nested command-sequence evaluation, substituted at that text position).
//! When an argument's entire text is exactly one such construct the
//! resolved value is returned as-is, preserving identity/type through the
//! pipeline; otherwise each match is stringified and spliced into the
//! surrounding literal text.

use std::sync::{Arc, Mutex};

use crate::errors::PawError;
use crate::parser::lexer::{is_ident_char, scan_balanced};
use crate::parser::types::RawArg;
use crate::store::{ObjectKind, StoredValue};
use crate::token::BraceCoordinator;
use crate::value::Value;

use super::executor::execute_sequence;
use super::runtime::Runtime;
use super::state::ExecutionState;

/// Expand one parsed argument into its runtime `Value`.
pub fn expand_arg(raw: &RawArg, state: &Arc<Mutex<ExecutionState>>, rt: &Arc<Runtime>) -> Result<Value, PawError> {
    match raw {
        RawArg::Single(s) => Ok(Value::Str(s.clone())),
        RawArg::Paren(s) => Ok(Value::ParenGroup(s.clone())),
        RawArg::Bare(s) => expand_text(s, state, rt, false),
        RawArg::Double(s) => expand_text(s, state, rt, true),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConstructKind {
    Positional,
    ArgsList,
    ArgsJoined,
    Variable,
    Object,
    Brace,
}

struct Construct {
    kind: ConstructKind,
    start: usize,
    end: usize,
    body: String,
}

fn scan_constructs(chars: &[char]) -> Vec<Construct> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        match chars[i] {
            '$' => {
                let start = i;
                let mut j = i + 1;
                if chars.get(j) == Some(&'@') {
                    out.push(Construct { kind: ConstructKind::ArgsList, start, end: j + 1, body: String::new() });
                    i = j + 1;
                    continue;
                }
                if chars.get(j) == Some(&'*') {
                    out.push(Construct { kind: ConstructKind::ArgsJoined, start, end: j + 1, body: String::new() });
                    i = j + 1;
                    continue;
                }
                let digit_start = j;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
                if j == digit_start {
                    i += 1;
                    continue;
                }
                let body: String = chars[digit_start..j].iter().collect();
                out.push(Construct { kind: ConstructKind::Positional, start, end: j, body });
                i = j;
            }
            '~' | '#' => {
                let start = i;
                let kind = if chars[i] == '~' { ConstructKind::Variable } else { ConstructKind::Object };
                let name_start = i + 1;
                let mut j = name_start;
                while j < chars.len() && is_ident_char(chars[j]) {
                    j += 1;
                }
                if j == name_start {
                    i += 1;
                    continue;
                }
                let body: String = chars[name_start..j].iter().collect();
                out.push(Construct { kind, start, end: j, body });
                i = j;
            }
            '{' => {
                let end = scan_balanced(chars, i, '{', '}');
                let inner_end = end.saturating_sub(1).max(i + 1);
                let body: String = chars[(i + 1)..inner_end].iter().collect();
                out.push(Construct { kind: ConstructKind::Brace, start: i, end, body });
                i = end;
            }
            _ => i += 1,
        }
    }
    out
}

fn expand_text(s: &str, state: &Arc<Mutex<ExecutionState>>, rt: &Arc<Runtime>, quoted: bool) -> Result<Value, PawError> {
    let chars: Vec<char> = s.chars().collect();
    let constructs = scan_constructs(&chars);

    if constructs.len() == 1 && constructs[0].start == 0 && constructs[0].end == chars.len() {
        return resolve_construct(&constructs[0], state, rt);
    }
    if constructs.is_empty() {
        return Ok(parse_literal(s, quoted));
    }

    let brace_positions: Vec<usize> =
        constructs.iter().enumerate().filter(|(_, c)| c.kind == ConstructKind::Brace).map(|(i, _)| i).collect();

    let mut text_for: Vec<String> = vec![String::new(); constructs.len()];
    if brace_positions.len() > 1 {
        let groups: Vec<(usize, usize)> = brace_positions.iter().map(|&i| (constructs[i].start, constructs[i].end)).collect();
        let coordinator = Arc::new(Mutex::new(BraceCoordinator::new(s.to_string(), groups)));
        let mut handles = Vec::new();
        for (slot, &ci) in brace_positions.iter().enumerate() {
            let expr = constructs[ci].body.clone();
            let state = state.clone();
            let rt = rt.clone();
            let coordinator = coordinator.clone();
            handles.push(std::thread::spawn(move || {
                let (value, ok) = run_brace_expr(&expr, &state, &rt);
                let text = rt.store.stringify_deep(&value);
                coordinator.lock().unwrap().resolve_child(slot, text, ok);
            }));
        }
        for h in handles {
            let _ = h.join();
        }
        let coord = coordinator.lock().unwrap();
        for (slot, &ci) in brace_positions.iter().enumerate() {
            text_for[ci] = coord.results[slot].clone().unwrap_or_default();
        }
        drop(coord);
        for (i, c) in constructs.iter().enumerate() {
            if c.kind != ConstructKind::Brace {
                let v = resolve_construct(c, state, rt)?;
                text_for[i] = rt.store.stringify_deep(&v);
            }
        }
    } else {
        for (i, c) in constructs.iter().enumerate() {
            let v = resolve_construct(c, state, rt)?;
            text_for[i] = rt.store.stringify_deep(&v);
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut cursor = 0usize;
    for (i, c) in constructs.iter().enumerate() {
        out.extend(&chars[cursor..c.start]);
        out.push_str(&text_for[i]);
        cursor = c.end;
    }
    out.extend(&chars[cursor..]);
    Ok(parse_literal(&out, quoted))
}

fn run_brace_expr(expr: &str, state: &Arc<Mutex<ExecutionState>>, rt: &Arc<Runtime>) -> (Value, bool) {
    match crate::parser::parse_command_sequence(expr) {
        Ok(commands) => match execute_sequence(state.clone(), rt, &commands) {
            Ok(result) => (result.value(), result.status()),
            Err(_) => (Value::Null, false),
        },
        Err(_) => (Value::Null, false),
    }
}

fn parse_literal(s: &str, quoted: bool) -> Value {
    if quoted {
        return Value::QuotedStr(s.to_string());
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Symbol(s.to_string())
}

fn resolve_construct(c: &Construct, state: &Arc<Mutex<ExecutionState>>, rt: &Arc<Runtime>) -> Result<Value, PawError> {
    match c.kind {
        ConstructKind::Positional => {
            state.lock().unwrap().get_variable(&c.body).cloned().ok_or_else(|| PawError::UndefinedVariable(c.body.clone()))
        }
        ConstructKind::ArgsList => {
            state.lock().unwrap().get_variable("@").cloned().ok_or_else(|| PawError::UndefinedVariable("@".to_string()))
        }
        ConstructKind::ArgsJoined => {
            let st = state.lock().unwrap();
            if let Some(v) = st.get_variable("@") {
                if let Value::ObjectRef { kind: ObjectKind::List, id } = rt.store.resolve_value(v) {
                    if let Some(StoredValue::List(list)) = rt.store.get(id) {
                        let joined = list.items.iter().map(|v| v.stringify()).collect::<Vec<_>>().join(" ");
                        return Ok(Value::Str(joined));
                    }
                }
            }
            Ok(Value::Str(String::new()))
        }
        ConstructKind::Variable => {
            let st = state.lock().unwrap();
            if let Some(v) = st.get_variable(&c.body) {
                return Ok(v.clone());
            }
            st.module_env.get_object(&c.body).ok_or_else(|| PawError::UndefinedVariable(c.body.clone()))
        }
        ConstructKind::Object => {
            let st = state.lock().unwrap();
            st.module_env.get_object(&c.body).ok_or_else(|| PawError::UndefinedVariable(c.body.clone()))
        }
        ConstructKind::Brace => {
            let (value, _ok) = run_brace_expr(&c.body, state, rt);
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_env::ModuleEnvironment;

    fn fresh() -> (Arc<Mutex<ExecutionState>>, Arc<Runtime>) {
        let rt = Runtime::new();
        let state = Arc::new(Mutex::new(ExecutionState::new(rt.store.clone(), ModuleEnvironment::root())));
        (state, rt)
    }

    #[test]
    fn whole_variable_substitution_preserves_type() {
        let (state, rt) = fresh();
        state.lock().unwrap().set_variable("x", Value::Int(42));
        let v = expand_arg(&RawArg::Bare("~x".to_string()), &state, &rt).unwrap();
        assert_eq!(v, Value::Int(42));
    }

    #[test]
    fn embedded_variable_is_stringified() {
        let (state, rt) = fresh();
        state.lock().unwrap().set_variable("x", Value::Int(42));
        let v = expand_arg(&RawArg::Bare("val=~x!".to_string()), &state, &rt).unwrap();
        assert_eq!(v, Value::Symbol("val=42!".to_string()));
    }

    #[test]
    fn positional_arg_lookup() {
        let (state, rt) = fresh();
        state.lock().unwrap().set_variable("1", Value::Str("hi".into()));
        let v = expand_arg(&RawArg::Bare("$1".to_string()), &state, &rt).unwrap();
        assert_eq!(v, Value::Str("hi".into()));
    }

    #[test]
    fn undefined_variable_errors() {
        let (state, rt) = fresh();
        let err = expand_arg(&RawArg::Bare("~missing".to_string()), &state, &rt).unwrap_err();
        assert!(matches!(err, PawError::UndefinedVariable(_)));
    }
}
