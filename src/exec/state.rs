//! Execution state (spec.md §3.4)
//!
//! One `ExecutionState` per running command sequence: its local variables,
//! the `$status`/`$result` registers left by the last command, bubbles
//! accumulated in this scope, and the module environment commands/macros/
//! objects resolve against. Variable slots that hold an object marker keep
//! that object claimed for the state's lifetime; `Drop` releases them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::generator::LoopContinuation;
use crate::macros::MacroContext;
use crate::module_env::ModuleEnvironment;
use crate::store::ObjectStore;
use crate::value::Value;

pub struct ExecutionState {
    pub variables: HashMap<String, Value>,
    pub result: Value,
    pub status: bool,
    /// Bubbles recorded in this scope, keyed by flavor name.
    pub bubbles: HashMap<String, Vec<Value>>,
    pub module_env: Arc<ModuleEnvironment>,
    pub parent: Option<Arc<Mutex<ExecutionState>>>,
    pub loop_continuation: Option<Box<LoopContinuation>>,
    /// Set on a macro invocation's child state; `stack_trace` walks
    /// `parent` collecting these (spec.md §4.7).
    pub macro_ctx: Option<MacroContext>,
    store: Arc<ObjectStore>,
}

impl ExecutionState {
    pub fn new(store: Arc<ObjectStore>, module_env: Arc<ModuleEnvironment>) -> Self {
        Self {
            variables: HashMap::new(),
            result: Value::Null,
            status: true,
            bubbles: HashMap::new(),
            module_env,
            parent: None,
            loop_continuation: None,
            macro_ctx: None,
            store,
        }
    }

    pub fn child(parent: Arc<Mutex<ExecutionState>>, module_env: Arc<ModuleEnvironment>, store: Arc<ObjectStore>) -> Self {
        Self {
            variables: HashMap::new(),
            result: Value::Null,
            status: true,
            bubbles: HashMap::new(),
            module_env,
            parent: Some(parent),
            loop_continuation: None,
            macro_ctx: None,
            store,
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Assign a variable, claiming the new value's object reference (if
    /// any) and releasing the slot's previous one.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        if let Some((_, id)) = value.as_object_ref() {
            self.store.claim(id);
        }
        if let Some(old) = self.variables.insert(name.into(), value) {
            if let Some((_, id)) = old.as_object_ref() {
                self.store.release(id);
            }
        }
    }

    /// Store `value` as `$result`, claiming its object reference (if any)
    /// and releasing the previous result's (spec.md §3.4: `SetResult`
    /// follows the same claim-on-store/release-on-overwrite rule as
    /// `SetVariable`).
    pub fn set_result(&mut self, value: Value) {
        if let Some((_, id)) = value.as_object_ref() {
            self.store.claim(id);
        }
        let old = std::mem::replace(&mut self.result, value);
        if let Some((_, id)) = old.as_object_ref() {
            self.store.release(id);
        }
    }

    pub fn unset_variable(&mut self, name: &str) -> Option<Value> {
        let old = self.variables.remove(name);
        if let Some((_, id)) = old.as_ref().and_then(|v| v.as_object_ref()) {
            self.store.release(id);
        }
        old
    }

    pub fn push_bubble(&mut self, flavor: impl Into<String>, value: Value) {
        self.bubbles.entry(flavor.into()).or_default().push(value);
    }

    /// Merge this scope's bubbles up into its parent on completion
    /// (spec.md §4.8: bubbles merge up fiber/scope boundaries).
    pub fn merge_bubbles_into_parent(&mut self) {
        let Some(parent) = self.parent.clone() else { return };
        let mut parent = parent.lock().unwrap();
        for (flavor, mut values) in self.bubbles.drain() {
            parent.bubbles.entry(flavor).or_default().append(&mut values);
        }
    }

    pub fn take_bubbles(&mut self, flavor: &str) -> Vec<Value> {
        self.bubbles.remove(flavor).unwrap_or_default()
    }
}

impl Drop for ExecutionState {
    fn drop(&mut self) {
        for v in self.variables.values() {
            if let Some((_, id)) = v.as_object_ref() {
                self.store.release(id);
            }
        }
        if let Some((_, id)) = self.result.as_object_ref() {
            self.store.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectKind;

    #[test]
    fn set_variable_releases_previous_object_ref() {
        let store = Arc::new(ObjectStore::new());
        let id = store.store_object(crate::store::StoredValue::Str("x".into()), ObjectKind::String);
        let mut state = ExecutionState::new(store.clone(), ModuleEnvironment::root());
        state.set_variable("a", Value::ObjectRef { kind: ObjectKind::String, id });
        assert_eq!(store.ref_count(id), Some(1));
        state.set_variable("a", Value::Int(1));
        assert!(store.is_empty());
    }

    #[test]
    fn bubbles_merge_into_parent_scope() {
        let store = Arc::new(ObjectStore::new());
        let parent = Arc::new(Mutex::new(ExecutionState::new(store.clone(), ModuleEnvironment::root())));
        let mut child = ExecutionState::child(parent.clone(), ModuleEnvironment::root(), store);
        child.push_bubble("warn", Value::Str("oops".into()));
        child.merge_bubbles_into_parent();
        assert_eq!(parent.lock().unwrap().bubbles["warn"].len(), 1);
    }
}
