//! Object store (heap) — spec.md §3.2.
//!
//! A global, monotonic `id -> Cell { value, kind, refCount, deleted }`
//! table. IDs are monotonic; freed IDs are recycled from a free list.
//! Execution states own claims through their own `ownedObjects` map
//! (`exec::state::ExecutionState`); this type only implements the
//! store-wide claim/release/resolve machinery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::list::PawList;
use crate::macros::StoredMacro;
use crate::value::Value;

pub type ObjectId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    List,
    String,
    Block,
    Macro,
    Command,
    Fiber,
    Channel,
    Struct,
    StructDef,
    Token,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::List => "LIST",
            ObjectKind::String => "STRING",
            ObjectKind::Block => "BLOCK",
            ObjectKind::Macro => "MACRO",
            ObjectKind::Command => "COMMAND",
            ObjectKind::Fiber => "FIBER",
            ObjectKind::Channel => "CHANNEL",
            ObjectKind::Struct => "STRUCT",
            ObjectKind::StructDef => "STRUCTDEF",
            ObjectKind::Token => "TOKEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "LIST" => ObjectKind::List,
            "STRING" => ObjectKind::String,
            "BLOCK" => ObjectKind::Block,
            "MACRO" => ObjectKind::Macro,
            "COMMAND" => ObjectKind::Command,
            "FIBER" => ObjectKind::Fiber,
            "CHANNEL" => ObjectKind::Channel,
            "STRUCT" => ObjectKind::Struct,
            "STRUCTDEF" => ObjectKind::StructDef,
            "TOKEN" => ObjectKind::Token,
            _ => return None,
        })
    }
}

/// The value actually held by a heap cell. Distinct from `Value` because a
/// stored string/block is owned data, not a reference that needs claiming.
#[derive(Clone)]
pub enum StoredValue {
    List(PawList),
    Str(String),
    Block(String),
    Macro(Arc<StoredMacro>),
    Command(String),
    Fiber(u64),
    Channel(Arc<crate::token::Channel>),
    Struct(PawList),
    StructDef(Vec<String>),
    Token(u64),
}

struct Cell {
    value: StoredValue,
    kind: ObjectKind,
    ref_count: u64,
    deleted: bool,
}

#[derive(Default)]
struct Inner {
    cells: HashMap<ObjectId, Cell>,
    next_id: ObjectId,
    free_ids: Vec<ObjectId>,
}

/// The executor-wide heap. One per `host::Instance`.
#[derive(Default)]
pub struct ObjectStore {
    inner: Mutex<Inner>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under a fresh id with refCount = 0; the caller MUST
    /// claim it (spec.md §3.2).
    pub fn store_object(&self, value: StoredValue, kind: ObjectKind) -> ObjectId {
        let mut inner = self.inner.lock().unwrap();
        let id = if let Some(id) = inner.free_ids.pop() {
            id
        } else {
            inner.next_id += 1;
            inner.next_id
        };
        inner.cells.insert(id, Cell { value, kind, ref_count: 0, deleted: false });
        id
    }

    pub fn claim(&self, id: ObjectId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cell) = inner.cells.get_mut(&id) {
            cell.ref_count += 1;
        }
    }

    /// Decrement the refcount; free the cell (and recursively release any
    /// `ObjectRef` children) when it reaches zero. The lock is dropped
    /// before recursing, per spec.md §5's reentrancy rule.
    pub fn release(&self, id: ObjectId) {
        let children = {
            let mut inner = self.inner.lock().unwrap();
            let Some(cell) = inner.cells.get_mut(&id) else { return };
            if cell.ref_count == 0 {
                return;
            }
            cell.ref_count -= 1;
            if cell.ref_count > 0 {
                return;
            }
            let cell = inner.cells.remove(&id).unwrap();
            inner.free_ids.push(id);
            child_refs(&cell.value)
        };
        for (_, child_id) in children {
            self.release(child_id);
        }
    }

    /// Force-remove a cell bypassing refcount (token timeout cleanup,
    /// spec.md §4.4/§5).
    pub fn force_delete(&self, id: ObjectId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cell) = inner.cells.get_mut(&id) {
            cell.deleted = true;
        }
        inner.cells.remove(&id);
        inner.free_ids.push(id);
    }

    pub fn get(&self, id: ObjectId) -> Option<StoredValue> {
        let inner = self.inner.lock().unwrap();
        inner.cells.get(&id).map(|c| c.value.clone())
    }

    /// Claim every object-ref child of `list` on the list's own behalf.
    /// `release` recurses into a freed list/struct cell's children
    /// assuming each was claimed once when the list was built (spec.md
    /// §3.2/§3.3); any code that stores a fresh `PawList` whose items or
    /// named entries may themselves be object refs must call this right
    /// after `store_object`, or those children end up released one more
    /// time than they were ever claimed.
    pub fn claim_list_children(&self, list: &PawList) {
        for (_, id) in list.child_object_refs() {
            self.claim(id);
        }
    }

    pub fn kind_of(&self, id: ObjectId) -> Option<ObjectKind> {
        let inner = self.inner.lock().unwrap();
        inner.cells.get(&id).map(|c| c.kind)
    }

    pub fn set(&self, id: ObjectId, value: StoredValue) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cell) = inner.cells.get_mut(&id) {
            cell.value = value;
        }
    }

    pub fn ref_count(&self, id: ObjectId) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.cells.get(&id).map(|c| c.ref_count)
    }

    /// True once every stored id has been freed -- the refcount-soundness
    /// invariant (spec.md §8) a test suite checks after teardown.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().cells.len()
    }

    /// `resolveValue` (spec.md §3.2): if `v` is a symbol containing a
    /// marker, return the stored value (strings/blocks inline, everything
    /// else stays an `ObjectRef` to preserve identity); otherwise `v`
    /// unchanged.
    pub fn resolve_value(&self, v: &Value) -> Value {
        let Value::Symbol(s) = v else { return v.clone() };
        let Some((kind, id)) = Value::parse_marker(s) else { return v.clone() };
        let inner = self.inner.lock().unwrap();
        match inner.cells.get(&id).map(|c| &c.value) {
            Some(StoredValue::Str(s)) => Value::Str(s.clone()),
            Some(StoredValue::Block(s)) => Value::ParenGroup(s.clone()),
            Some(_) => Value::ObjectRef { kind, id },
            None => v.clone(),
        }
    }

    /// Stringify `v`, recursing into list items/named entries the way
    /// spec.md §9 fixes nested-list formatting: `(a, b, k: v)`.
    pub fn stringify_deep(&self, v: &Value) -> String {
        let resolved = self.resolve_value(v);
        if let Value::ObjectRef { kind: ObjectKind::List, id } = resolved {
            if let Some(StoredValue::List(list)) = self.get(id) {
                return list.format(&|item| self.stringify_deep(item));
            }
        }
        resolved.stringify()
    }
}

fn child_refs(value: &StoredValue) -> Vec<(ObjectKind, ObjectId)> {
    match value {
        StoredValue::List(list) | StoredValue::Struct(list) => list.child_object_refs(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_claim_release_frees_cell() {
        let store = ObjectStore::new();
        let id = store.store_object(StoredValue::Str("hi".into()), ObjectKind::String);
        store.claim(id);
        assert_eq!(store.len(), 1);
        store.release(id);
        assert!(store.is_empty());
    }

    #[test]
    fn release_recurses_into_list_children() {
        let store = ObjectStore::new();
        let inner_id = store.store_object(StoredValue::Str("x".into()), ObjectKind::String);
        store.claim(inner_id);
        let list = PawList::from_items(vec![Value::ObjectRef { kind: ObjectKind::String, id: inner_id }]);
        let list_id = store.store_object(StoredValue::List(list), ObjectKind::List);
        store.claim(list_id);

        store.release(list_id);
        assert!(store.is_empty());
    }

    #[test]
    fn resolve_value_inlines_strings_but_preserves_object_identity() {
        let store = ObjectStore::new();
        let id = store.store_object(StoredValue::List(PawList::new()), ObjectKind::List);
        store.claim(id);
        let marker = Value::marker(ObjectKind::List, id);
        let resolved = store.resolve_value(&marker);
        assert_eq!(resolved.as_object_ref(), Some((ObjectKind::List, id)));
        store.release(id);
    }

    #[test]
    fn freed_ids_are_reused() {
        let store = ObjectStore::new();
        let a = store.store_object(StoredValue::Str("a".into()), ObjectKind::String);
        store.claim(a);
        store.release(a);
        let b = store.store_object(StoredValue::Str("b".into()), ObjectKind::String);
        assert_eq!(a, b);
    }
}
