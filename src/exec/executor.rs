//! Executor core (spec.md §4.3)
//!
//! Dispatch, sequencing (`;`/`&`/`|`), loop-control propagation, and macro
//! invocation. A sequence is a flat list of `ParsedCommand`s; conditional/
//! OR short-circuiting and loop-control unwinding are both handled here,
//! one command pair at a time, per spec.md's "flow control is per
//! command-pair" rule.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use super::context::Context;
use super::result::HandlerResult;
use super::runtime::Runtime;
use super::state::ExecutionState;
use super::substitution::expand_arg;
use crate::errors::PawError;
use crate::list::PawList;
use crate::macros::{bind_positional_args, MacroContext, StoredMacro};
use crate::parser::{ParsedCommand, Separator};
use crate::store::{ObjectKind, StoredValue};
use crate::value::Value;

/// Run a flat command sequence against `state`, honoring `&`/`|`
/// short-circuiting. Stops early and returns a loop-control/early-return
/// `HandlerResult` unchanged so the enclosing loop/macro frame can unwind.
pub fn execute_sequence(
    state: Arc<Mutex<ExecutionState>>,
    rt: &Arc<Runtime>,
    commands: &[ParsedCommand],
) -> Result<HandlerResult, PawError> {
    let (result, _) = execute_sequence_from(state, rt, commands, 0)?;
    Ok(result)
}

/// Run `commands[start..]` against `state`, honoring `&`/`|`
/// short-circuiting like `execute_sequence`, but stop and report the index
/// to resume from the moment a command yields/suspends (spec.md §4.3's
/// "`yield`/`suspend` inside a body" and §4.6's loop continuations) as well
/// as on loop-control/early-return. Shared by loop bodies (so a `yield`
/// nested inside a loop actually suspends the loop, spec.md §4.6) and by
/// `builtins::resume_token`'s top-level generator driver.
pub fn execute_sequence_from(
    state: Arc<Mutex<ExecutionState>>,
    rt: &Arc<Runtime>,
    commands: &[ParsedCommand],
    start: usize,
) -> Result<(HandlerResult, usize), PawError> {
    let mut last = HandlerResult::Status(true);
    let mut idx = start;
    while idx < commands.len() {
        let cmd = &commands[idx];
        let run = match cmd.separator {
            Separator::None | Separator::Sequence => true,
            Separator::Then => last.status(),
            Separator::Else => !last.status(),
        };
        if !run {
            idx += 1;
            continue;
        }
        last = dispatch_command(state.clone(), rt, cmd)?;
        idx += 1;
        if last.is_loop_control() || matches!(last, HandlerResult::Yield(_) | HandlerResult::YieldLoop(_, _) | HandlerResult::Suspend) {
            return Ok((last, idx));
        }
    }
    Ok((last, idx))
}

/// Resolve, substitute, and invoke one command.
pub fn dispatch_command(state: Arc<Mutex<ExecutionState>>, rt: &Arc<Runtime>, cmd: &ParsedCommand) -> Result<HandlerResult, PawError> {
    let mut args = Vec::with_capacity(cmd.args.len());
    for raw in &cmd.args {
        args.push(expand_arg(raw, &state, rt)?);
    }
    let mut named_args = IndexMap::new();
    for (name, raw) in &cmd.named_args {
        named_args.insert(name.clone(), expand_arg(raw, &state, rt)?);
    }

    enum Resolved {
        Command(Arc<HandlerFnAlias>),
        Macro(Arc<StoredMacro>),
        None,
    }
    type HandlerFnAlias = crate::exec::context::HandlerFn;

    let resolved = {
        let st = state.lock().unwrap();
        if let Some(entry) = st.module_env.get_command(&cmd.command) {
            Resolved::Command(entry.handler.clone())
        } else if let Some(m) = st.module_env.get_macro(&cmd.command) {
            Resolved::Macro(m)
        } else {
            Resolved::None
        }
    };

    match resolved {
        Resolved::Command(handler) => {
            let mut ctx = Context { args, named_args, state: state.clone(), runtime: rt.clone(), fiber_id: crate::fiber::current_fiber_id() };
            let result = handler(&mut ctx);
            Ok(settle(state, rt, result))
        }
        Resolved::Macro(stored) => invoke_macro(state, rt, &stored, cmd, args, named_args),
        Resolved::None => {
            let fallback = state.lock().unwrap().module_env.get_fallback();
            match fallback {
                Some(entry) => {
                    let mut ctx =
                        Context { args, named_args, state: state.clone(), runtime: rt.clone(), fiber_id: crate::fiber::current_fiber_id() };
                    let result = (entry.handler)(&mut ctx);
                    Ok(settle(state, rt, result))
                }
                None => Err(PawError::UnknownCommand(cmd.command.clone())),
            }
        }
    }
}

/// A handler that returns a token hands control back to the executor,
/// which -- per spec.md §6.1's synchronous top-level `execute()` -- blocks
/// the calling thread until that token resolves before sequencing the
/// next command. Records `$status`/`$result` either way.
fn settle(state: Arc<Mutex<ExecutionState>>, rt: &Arc<Runtime>, result: HandlerResult) -> HandlerResult {
    let settled = if let HandlerResult::Token(id) = result {
        let (status, value) = rt.tokens.wait_blocking(id);
        HandlerResult::ValueStatus(value.unwrap_or(Value::Null), status)
    } else {
        result
    };
    let mut st = state.lock().unwrap();
    st.status = settled.status();
    st.set_result(settled.value());
    settled
}

fn invoke_macro(
    caller: Arc<Mutex<ExecutionState>>,
    rt: &Arc<Runtime>,
    stored: &Arc<StoredMacro>,
    cmd: &ParsedCommand,
    args: Vec<Value>,
    named: IndexMap<String, Value>,
) -> Result<HandlerResult, PawError> {
    let module_env = stored.module_env.clone().unwrap_or_else(|| caller.lock().unwrap().module_env.clone());
    let mut child = ExecutionState::child(caller.clone(), module_env, rt.store.clone());
    child.macro_ctx = Some(MacroContext {
        name: cmd.command.clone(),
        definition_file: stored.definition_file.clone(),
        call_line: cmd.position.line,
        call_column: cmd.position.column,
    });

    let args_list = PawList::from_items(args.clone());
    rt.store.claim_list_children(&args_list);
    let list_id = rt.store.store_object(StoredValue::List(args_list), ObjectKind::List);
    child.set_variable("@", Value::marker(ObjectKind::List, list_id));

    for (name, value) in bind_positional_args(&args) {
        child.set_variable(name, value);
    }
    for (name, value) in named {
        child.set_variable(name, value);
    }

    let shared = Arc::new(Mutex::new(child));
    let result = execute_sequence(shared.clone(), rt, &stored.commands)?;
    shared.lock().unwrap().merge_bubbles_into_parent();

    Ok(match result {
        HandlerResult::Return(v) => HandlerResult::Value(v),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_env::{CommandEntry, ModuleEnvironment};

    fn echo_handler() -> CommandEntry {
        CommandEntry {
            name: "echo".into(),
            handler: Arc::new(|ctx: &mut Context| HandlerResult::Value(ctx.args.first().cloned().unwrap_or(Value::Null))),
        }
    }

    #[test]
    fn dispatch_runs_native_command() {
        let rt = Runtime::new();
        let env = ModuleEnvironment::root();
        env.define_command("echo", echo_handler());
        let state = Arc::new(Mutex::new(ExecutionState::new(rt.store.clone(), env)));
        let cmds = crate::parser::parse_command_sequence("echo hi").unwrap();
        let result = execute_sequence(state, &rt, &cmds).unwrap();
        assert_eq!(result.value(), Value::Symbol("hi".to_string()));
    }

    #[test]
    fn then_else_short_circuit() {
        let rt = Runtime::new();
        let env = ModuleEnvironment::root();
        env.define_command("fail", CommandEntry { name: "fail".into(), handler: Arc::new(|_ctx: &mut Context| HandlerResult::Status(false)) });
        env.define_command("echo", echo_handler());
        let state = Arc::new(Mutex::new(ExecutionState::new(rt.store.clone(), env)));
        let cmds = crate::parser::parse_command_sequence("fail & echo yes | echo no").unwrap();
        let result = execute_sequence(state, &rt, &cmds).unwrap();
        assert_eq!(result.value(), Value::Symbol("no".to_string()));
    }
}
