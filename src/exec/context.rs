//! Handler invocation context (spec.md §4.1, §6.2)
//!
//! `state` is the shared, mutex-guarded execution state rather than a
//! borrowed reference so that control-flow builtins (`while`, `each`,
//! `generator`, ...) can recurse back into `exec::executor::execute_sequence`
//! with it -- the same handle the dispatch loop itself holds (spec.md §5:
//! "never hold a state mutex across substitution, which calls back into
//! dispatch").

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use super::result::HandlerResult;
use super::runtime::Runtime;
use super::state::ExecutionState;
use crate::value::Value;

pub type HandlerFn = dyn Fn(&mut Context) -> HandlerResult + Send + Sync;

pub struct Context {
    pub args: Vec<Value>,
    pub named_args: IndexMap<String, Value>,
    pub state: Arc<Mutex<ExecutionState>>,
    pub runtime: Arc<Runtime>,
    pub fiber_id: u64,
}

impl Context {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn named(&self, name: &str) -> Option<&Value> {
        self.named_args.get(name)
    }

    /// Resolve a value through the heap (handlers that receive an object
    /// marker by value still want the live `StoredValue`, spec.md §3.2).
    pub fn resolve(&self, v: &Value) -> Value {
        self.runtime.store.resolve_value(v)
    }

    pub fn stringify(&self, v: &Value) -> String {
        self.runtime.store.stringify_deep(v)
    }
}
