//! Macro system (spec.md §4.7)
//!
//! A `StoredMacro` is a user-defined command: a stored body of parsed
//! commands plus definition-site metadata used to re-base parse/runtime
//! errors and to label `stack_trace` frames.

use std::sync::Arc;

use crate::module_env::ModuleEnvironment;
use crate::parser::ParsedCommand;
use crate::value::Value;

pub struct StoredMacro {
    pub commands: Vec<ParsedCommand>,
    pub definition_file: Option<String>,
    pub line: usize,
    pub column: usize,
    /// The module environment active when this macro was defined, used so
    /// a macro body still resolves commands/macros lexically in scope at
    /// its definition site even if invoked from elsewhere.
    pub module_env: Option<Arc<ModuleEnvironment>>,
}

/// One frame of the macro call stack, consulted by the `stack_trace`
/// builtin (spec.md §4.7).
#[derive(Debug, Clone)]
pub struct MacroContext {
    pub name: String,
    pub definition_file: Option<String>,
    pub call_line: usize,
    pub call_column: usize,
}

/// Bind positional/named arguments for a macro invocation into the
/// variable map a fresh child `ExecutionState` will own: `$1..$N`, `$@`
/// (claimed as a list object by the caller), and named args installed by
/// name (spec.md §4.7).
pub fn bind_positional_args(args: &[Value]) -> Vec<(String, Value)> {
    args.iter().enumerate().map(|(i, v)| (format!("{}", i + 1), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_one_indexed_positional_args() {
        let bound = bind_positional_args(&[Value::Int(10), Value::Int(20)]);
        assert_eq!(bound[0].0, "1");
        assert_eq!(bound[1].0, "2");
    }
}
