//! Lists (spec.md §3.3)
//!
//! A list has ordered positional items plus an unordered mapping of
//! string-keyed named items. Lists are immutable in their external
//! contract: `append`/`prepend`/`slice` return new list values: the caller
//! (`store::ObjectStore`) is responsible for storing the new value and
//! claiming references to any `ObjectRef` children.

use indexmap::IndexMap;

use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct PawList {
    pub items: Vec<Value>,
    pub named: IndexMap<String, Value>,
}

impl PawList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<Value>) -> Self {
        Self { items, named: IndexMap::new() }
    }

    pub fn append(&self, value: Value) -> PawList {
        let mut next = self.clone();
        next.items.push(value);
        next
    }

    pub fn prepend(&self, value: Value) -> PawList {
        let mut next = self.clone();
        next.items.insert(0, value);
        next
    }

    pub fn slice(&self, start: usize, end: usize) -> PawList {
        let end = end.min(self.items.len());
        let start = start.min(end);
        PawList { items: self.items[start..end].to_vec(), named: self.named.clone() }
    }

    pub fn with_named(&self, key: impl Into<String>, value: Value) -> PawList {
        let mut next = self.clone();
        next.named.insert(key.into(), value);
        next
    }

    /// All child `ObjectRef`s -- positional then named -- that a claim/
    /// release pass over this list must walk (spec.md §3.3, §3.2).
    pub fn child_object_refs(&self) -> Vec<(crate::store::ObjectKind, u64)> {
        self.items
            .iter()
            .chain(self.named.values())
            .filter_map(|v| v.as_object_ref())
            .collect()
    }

    /// Stringify nested lists the way spec.md §9 fixes: `(a, b, k: v)`.
    pub fn format(&self, stringify: &dyn Fn(&Value) -> String) -> String {
        let mut parts: Vec<String> = self.items.iter().map(|v| stringify(v)).collect();
        for (k, v) in &self.named {
            parts.push(format!("{k}: {}", stringify(v)));
        }
        format!("({})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_new_list() {
        let a = PawList::from_items(vec![Value::Int(1)]);
        let b = a.append(Value::Int(2));
        assert_eq!(a.items.len(), 1);
        assert_eq!(b.items.len(), 2);
    }

    #[test]
    fn formats_named_and_positional() {
        let list = PawList::from_items(vec![Value::Int(1), Value::Int(2)])
            .with_named("k", Value::Str("v".into()));
        assert_eq!(list.format(&|v| v.stringify()), "(1, 2, k: v)");
    }
}
