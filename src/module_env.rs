//! Module environment (spec.md §3.5)
//!
//! Two layers per registry (`Inherited`, `Module`) for each of: commands,
//! macros, objects. Both layers start pointing at the same underlying map;
//! the first write to the module layer triggers a copy-on-write clone.
//! Child environments reference the parent's `Module` layer as their
//! `Inherited`. `Arc::make_mut` gives us exactly this semantics for free: a
//! write clones only when some other owner (the parent, or a sibling
//! child) still holds the `Arc`. Each registry sits behind a `Mutex` so a
//! native command holding only `Arc<ModuleEnvironment>` (spec.md §6.1's
//! `registerCommand`, the `macro` builtin, `export`) can still mutate it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::exec::context::HandlerFn;
use crate::macros::StoredMacro;
use crate::value::Value;

/// A registered native command: its handler plus a human-readable name
/// (used by `stack_trace`/diagnostics).
#[derive(Clone)]
pub struct CommandEntry {
    pub name: String,
    pub handler: Arc<HandlerFn>,
}

/// A copy-on-write two-layer registry: module-local entries shadow
/// inherited ones; writes only ever touch the module layer.
#[derive(Clone)]
pub struct Registry<V: Clone> {
    inherited: Arc<HashMap<String, V>>,
    module: Arc<HashMap<String, V>>,
}

impl<V: Clone> Default for Registry<V> {
    fn default() -> Self {
        Self { inherited: Arc::new(HashMap::new()), module: Arc::new(HashMap::new()) }
    }
}

impl<V: Clone> Registry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A child environment's registry: its inherited layer is this
    /// registry's *module* layer (so it sees parent commands/macros/
    /// objects), and its own module layer starts out pointing at the same
    /// backing map -- shared, read-only, until the child writes.
    pub fn child(&self) -> Self {
        Self { inherited: self.module.clone(), module: self.module.clone() }
    }

    /// Lookup: module layer first, then inherited.
    pub fn get(&self, name: &str) -> Option<V> {
        self.module.get(name).or_else(|| self.inherited.get(name)).cloned()
    }

    pub fn get_module_local(&self, name: &str) -> Option<V> {
        self.module.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Write into the module layer, cloning it first if anyone else
    /// (parent, sibling) still shares it.
    pub fn insert(&mut self, name: String, value: V) {
        Arc::make_mut(&mut self.module).insert(name, value);
    }

    pub fn remove(&mut self, name: &str) -> Option<V> {
        Arc::make_mut(&mut self.module).remove(name)
    }

    pub fn clear(&mut self) {
        Arc::make_mut(&mut self.module).clear();
    }

    /// Write into the *inherited* layer -- used when merging a completed
    /// module's exports into its caller (spec.md §3.5).
    pub fn insert_inherited(&mut self, name: String, value: V) {
        Arc::make_mut(&mut self.inherited).insert(name, value);
    }

    pub fn module_keys(&self) -> Vec<String> {
        self.module.keys().cloned().collect()
    }

    pub fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inherited.keys().chain(self.module.keys()).cloned().collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Entries accumulated via `export` during a module's execution, merged
/// into the caller's inherited layer on completion (spec.md §3.5).
#[derive(Default)]
pub struct ModuleExports {
    pub commands: Vec<(String, CommandEntry)>,
    pub macros: Vec<(String, Arc<StoredMacro>)>,
    pub objects: Vec<(String, Value)>,
}

/// A lexical scope for commands, macros, and named objects.
pub struct ModuleEnvironment {
    pub module_name: Option<String>,
    pub commands: Mutex<Registry<CommandEntry>>,
    pub macros: Mutex<Registry<Arc<StoredMacro>>>,
    pub objects: Mutex<Registry<Value>>,
    pub exports: Mutex<ModuleExports>,
    /// The instance-wide fallback command (spec.md §6.1's
    /// `setFallbackHandler`), shared by every environment in the tree --
    /// child environments hold the same `Arc` rather than their own copy.
    fallback: Arc<Mutex<Option<CommandEntry>>>,
}

impl ModuleEnvironment {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            module_name: None,
            commands: Mutex::new(Registry::new()),
            macros: Mutex::new(Registry::new()),
            objects: Mutex::new(Registry::new()),
            exports: Mutex::new(ModuleExports::default()),
            fallback: Arc::new(Mutex::new(None)),
        })
    }

    /// A child module environment: its inherited layers point at this
    /// environment's module layers.
    pub fn child(self: &Arc<Self>, module_name: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            module_name,
            commands: Mutex::new(self.commands.lock().unwrap().child()),
            macros: Mutex::new(self.macros.lock().unwrap().child()),
            objects: Mutex::new(self.objects.lock().unwrap().child()),
            exports: Mutex::new(ModuleExports::default()),
            fallback: self.fallback.clone(),
        })
    }

    pub fn get_fallback(&self) -> Option<CommandEntry> {
        self.fallback.lock().unwrap().clone()
    }

    pub fn set_fallback(&self, entry: CommandEntry) {
        *self.fallback.lock().unwrap() = Some(entry);
    }

    pub fn get_command(&self, name: &str) -> Option<CommandEntry> {
        self.commands.lock().unwrap().get(name)
    }

    pub fn define_command(&self, name: impl Into<String>, entry: CommandEntry) {
        self.commands.lock().unwrap().insert(name.into(), entry);
    }

    pub fn get_macro(&self, name: &str) -> Option<Arc<StoredMacro>> {
        self.macros.lock().unwrap().get(name)
    }

    pub fn define_macro(&self, name: impl Into<String>, m: Arc<StoredMacro>) {
        self.macros.lock().unwrap().insert(name.into(), m);
    }

    pub fn delete_macro(&self, name: &str) -> Option<Arc<StoredMacro>> {
        self.macros.lock().unwrap().remove(name)
    }

    pub fn clear_macros(&self) {
        self.macros.lock().unwrap().clear();
    }

    pub fn list_macros(&self) -> Vec<String> {
        self.macros.lock().unwrap().all_keys()
    }

    pub fn get_object(&self, name: &str) -> Option<Value> {
        self.objects.lock().unwrap().get(name)
    }

    pub fn set_object(&self, name: impl Into<String>, v: Value) {
        self.objects.lock().unwrap().insert(name.into(), v);
    }

    pub fn set_inherited_object(&self, name: impl Into<String>, v: Value) {
        self.objects.lock().unwrap().insert_inherited(name.into(), v);
    }

    /// Record an export to be merged into the caller's inherited layer
    /// once this module's body finishes running.
    pub fn export_command(&self, name: String, entry: CommandEntry) {
        self.exports.lock().unwrap().commands.push((name, entry));
    }

    pub fn export_macro(&self, name: String, m: Arc<StoredMacro>) {
        self.exports.lock().unwrap().macros.push((name, m));
    }

    pub fn export_object(&self, name: String, v: Value) {
        self.exports.lock().unwrap().objects.push((name, v));
    }

    /// Merge this environment's accumulated exports into `caller`'s
    /// inherited layer (spec.md §3.5: "merged into the caller's inherited
    /// layer on completion").
    pub fn merge_exports_into(&self, caller: &ModuleEnvironment) {
        let mut exports = self.exports.lock().unwrap();
        for (name, entry) in exports.commands.drain(..) {
            caller.commands.lock().unwrap().insert_inherited(name, entry);
        }
        for (name, m) in exports.macros.drain(..) {
            caller.macros.lock().unwrap().insert_inherited(name, m);
        }
        for (name, v) in exports.objects.drain(..) {
            caller.objects.lock().unwrap().insert_inherited(name, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::result::HandlerResult;

    fn dummy_handler() -> CommandEntry {
        CommandEntry {
            name: "noop".into(),
            handler: Arc::new(|_ctx: &mut crate::exec::context::Context| HandlerResult::Status(true)),
        }
    }

    #[test]
    fn cow_isolation_child_write_does_not_mutate_parent() {
        let root = ModuleEnvironment::root();
        let child = root.child(Some("m".into()));
        child.define_command("foo", dummy_handler());
        assert!(child.get_command("foo").is_some());
        assert!(root.get_command("foo").is_none());
    }

    #[test]
    fn child_sees_parent_module_layer_as_inherited() {
        let root = ModuleEnvironment::root();
        let m = Arc::new(StoredMacro { commands: Vec::new(), definition_file: None, line: 1, column: 1, module_env: None });
        root.define_macro("greet", m);
        let child = root.child(Some("m".into()));
        assert!(child.get_macro("greet").is_some());
    }
}
