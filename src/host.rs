//! Embedded host API (spec.md §6.1)
//!
//! `Instance` is what an embedding application holds: one `Runtime`
//! (heap/tokens/fibers), a root module environment, and a persistent root
//! execution state that `execute_in_root` runs against (so top-level
//! variables survive across calls the way a REPL's globals do).
//! `execute` instead runs each call in a fresh child scope of the root,
//! isolated from prior calls' locals but still seeing root commands,
//! macros, and objects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::errors::PawError;
use crate::exec::context::HandlerFn;
use crate::exec::{execute_sequence, ExecutionState, HandlerResult, Runtime};
use crate::macros::StoredMacro;
use crate::module_env::{CommandEntry, ModuleEnvironment};
use crate::token::TokenId;
use crate::value::Value;

pub struct Instance {
    pub runtime: Arc<Runtime>,
    pub root: Arc<ModuleEnvironment>,
    root_state: Arc<Mutex<ExecutionState>>,
    modules: Mutex<HashMap<String, Arc<ModuleEnvironment>>>,
    config: Config,
}

impl Instance {
    pub fn new(config: Config) -> Self {
        if config.install_logger {
            crate::logger::init_stderr_logger();
        }
        let runtime = Runtime::new();
        let root = ModuleEnvironment::root();
        crate::builtins::register(&root);
        let root_state = Arc::new(Mutex::new(ExecutionState::new(runtime.store.clone(), root.clone())));
        Self { runtime, root, root_state, modules: Mutex::new(HashMap::new()), config }
    }

    fn run(&self, state: Arc<Mutex<ExecutionState>>, script: &str) -> Result<HandlerResult, PawError> {
        if script.len() > self.config.limits.max_input_size {
            return Err(PawError::Other("input exceeds configured max_input_size".to_string()));
        }
        let commands = crate::parser::parse_command_sequence(script)?;
        execute_sequence(state, &self.runtime, &commands)
    }

    /// Run `script` in an isolated child scope of the root environment;
    /// its locals do not persist across calls.
    pub fn execute(&self, script: &str) -> Result<HandlerResult, PawError> {
        let state = Arc::new(Mutex::new(ExecutionState::child(
            self.root_state.clone(),
            self.root.clone(),
            self.runtime.store.clone(),
        )));
        self.run(state, script)
    }

    /// Run `script` directly against the persistent root scope: variables
    /// it sets are visible to subsequent `execute_in_root` calls.
    pub fn execute_in_root(&self, script: &str) -> Result<HandlerResult, PawError> {
        self.run(self.root_state.clone(), script)
    }

    /// Run `script` against a named module's environment (created via
    /// `register_command_in_module`/`register_object_in_module` if it
    /// doesn't exist yet), in a fresh child scope.
    pub fn execute_with_environment(&self, module: &str, script: &str) -> Result<HandlerResult, PawError> {
        let env = self.module_env(module);
        let state = Arc::new(Mutex::new(ExecutionState::child(self.root_state.clone(), env, self.runtime.store.clone())));
        self.run(state, script)
    }

    pub fn execute_file(&self, path: &std::path::Path) -> Result<HandlerResult, PawError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| PawError::Other(format!("reading {}: {e}", path.display())))?;
        self.execute(&contents)
    }

    fn module_env(&self, name: &str) -> Arc<ModuleEnvironment> {
        let mut modules = self.modules.lock().unwrap();
        modules.entry(name.to_string()).or_insert_with(|| self.root.child(Some(name.to_string()))).clone()
    }

    pub fn register_command(&self, name: impl Into<String>, handler: Arc<HandlerFn>) {
        let name = name.into();
        self.root.define_command(name.clone(), CommandEntry { name, handler });
    }

    pub fn register_command_in_module(&self, module: &str, name: impl Into<String>, handler: Arc<HandlerFn>) {
        let name = name.into();
        self.module_env(module).define_command(name.clone(), CommandEntry { name, handler });
    }

    pub fn register_object_in_module(&self, module: &str, name: impl Into<String>, value: Value) {
        self.module_env(module).set_object(name, value);
    }

    pub fn set_inherited_object(&self, name: impl Into<String>, value: Value) {
        self.root.set_inherited_object(name, value);
    }

    pub fn set_fallback_handler(&self, handler: Arc<HandlerFn>) {
        self.root.set_fallback(CommandEntry { name: "$fallback".to_string(), handler });
    }

    /// Copy every command/macro/object a module has defined directly (not
    /// its own inherited layer) into the root's module layer.
    pub fn import_module_to_root(&self, module: &str) {
        let env = self.module_env(module);
        let command_names = env.commands.lock().unwrap().module_keys();
        for name in command_names {
            if let Some(entry) = env.get_command(&name) {
                self.root.define_command(name, entry);
            }
        }
        for name in env.list_macros() {
            if let Some(m) = env.get_macro(&name) {
                self.root.define_macro(name, m);
            }
        }
        let object_names = env.objects.lock().unwrap().module_keys();
        for name in object_names {
            if let Some(v) = env.get_object(&name) {
                self.root.set_object(name, v);
            }
        }
    }

    pub fn has_library_module(&self, name: &str) -> bool {
        self.modules.lock().unwrap().contains_key(name)
    }

    pub fn define_macro(&self, name: impl Into<String>, body_src: &str) -> Result<(), PawError> {
        let commands = crate::parser::parse_command_sequence(body_src)?;
        let stored = Arc::new(StoredMacro { commands, definition_file: None, line: 1, column: 1, module_env: Some(self.root.clone()) });
        self.root.define_macro(name, stored);
        Ok(())
    }

    pub fn execute_macro(&self, name: &str, args: Vec<Value>) -> Result<HandlerResult, PawError> {
        let quoted = args.iter().map(|v| format!("\"{}\"", v.stringify().replace('"', "\\\""))).collect::<Vec<_>>().join(", ");
        let src = if quoted.is_empty() { name.to_string() } else { format!("{name} {quoted}") };
        self.execute(&src)
    }

    pub fn has_macro(&self, name: &str) -> bool {
        self.root.get_macro(name).is_some()
    }

    pub fn get_macro(&self, name: &str) -> Option<Arc<StoredMacro>> {
        self.root.get_macro(name)
    }

    pub fn list_macros(&self) -> Vec<String> {
        self.root.list_macros()
    }

    pub fn delete_macro(&self, name: &str) -> bool {
        self.root.delete_macro(name).is_some()
    }

    pub fn clear_macros(&self) {
        self.root.clear_macros();
    }

    pub fn request_token(&self, parent: Option<TokenId>) -> TokenId {
        let id = self.runtime.tokens.request_token(parent, 0);
        self.runtime.tokens.claim(id);
        if let Some(timeout) = self.config.limits.default_token_timeout {
            self.runtime.tokens.arm_timeout(id, timeout);
        }
        id
    }

    /// Arm a non-default timeout on an already-requested token.
    pub fn arm_token_timeout(&self, token: TokenId, timeout: Duration) {
        self.runtime.tokens.arm_timeout(token, timeout);
    }

    pub fn resume_token(&self, token: TokenId) -> HandlerResult {
        crate::builtins::resume_token(&self.runtime, token)
    }

    pub fn force_cleanup_token(&self, token: TokenId) {
        self.runtime.tokens.force_cleanup(token);
    }

    pub fn get_token_status(&self, token: TokenId) -> bool {
        self.runtime.tokens.is_completed(token)
    }

    /// A read-only-by-convention environment for sandboxed re-execution:
    /// a child of root whose writes never propagate back (spec.md §3.5's
    /// COW semantics already guarantee this -- the snapshot is simply a
    /// fresh child module environment taken at this moment).
    pub fn create_restricted_snapshot(&self) -> Arc<ModuleEnvironment> {
        self.root.child(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Context;

    #[test]
    fn execute_runs_registered_command() {
        let inst = Instance::new(Config::default());
        inst.register_command("echo", Arc::new(|ctx: &mut Context| HandlerResult::Value(ctx.args.first().cloned().unwrap_or(Value::Null))));
        let result = inst.execute("echo hi").unwrap();
        assert_eq!(result.value(), Value::Symbol("hi".to_string()));
    }

    #[test]
    fn execute_in_root_persists_variables_across_calls() {
        let inst = Instance::new(Config::default());
        inst.execute_in_root("set x, 5").unwrap();
        let result = inst.execute_in_root("set y, ~x").unwrap();
        assert!(result.status());
    }

    #[test]
    fn execute_isolates_locals_between_calls() {
        let inst = Instance::new(Config::default());
        inst.execute("set x, 5").unwrap();
        let err = inst.execute("set y, ~x").unwrap_err();
        assert!(matches!(err, PawError::UndefinedVariable(_)));
    }

    #[test]
    fn define_and_run_macro_through_the_host() {
        let inst = Instance::new(Config::default());
        inst.register_command("echo", Arc::new(|ctx: &mut Context| HandlerResult::Value(ctx.args.first().cloned().unwrap_or(Value::Null))));
        inst.define_macro("greet", "echo \"hi $1\"").unwrap();
        assert!(inst.has_macro("greet"));
        let result = inst.execute_macro("greet", vec![Value::str("world")]).unwrap();
        assert_eq!(result.value(), Value::QuotedStr("hi world".to_string()));
    }

    /// spec.md's macro-scoping testable property: a macro defined inside a
    /// module is visible only through that module until explicitly
    /// imported, never globally.
    #[test]
    fn macro_defined_in_module_is_not_visible_at_root_until_imported() {
        let inst = Instance::new(Config::default());
        inst.register_command("echo", Arc::new(|ctx: &mut Context| HandlerResult::Value(ctx.args.first().cloned().unwrap_or(Value::Null))));
        inst.execute_with_environment("greeter", "macro greet, (echo \"hi $1\")").unwrap();

        assert!(inst.execute_in_root("greet \"world\"").is_err());
        assert!(inst.execute_with_environment("greeter", "greet \"world\"").is_ok());

        inst.import_module_to_root("greeter");
        let result = inst.execute_in_root("greet \"world\"").unwrap();
        assert_eq!(result.value(), Value::QuotedStr("hi world".to_string()));
    }
}
