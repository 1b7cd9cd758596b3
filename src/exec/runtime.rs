//! Shared executor-wide infrastructure (spec.md §5)
//!
//! One `Runtime` per `host::Instance`: the heap, token table, and fiber
//! scheduler every execution state and handler call shares. Grouped into
//! one struct (rather than threading three `Arc`s everywhere) the way the
//! teacher's `Interpreter` bundles its shared subsystems.

use std::sync::Arc;

use crate::fiber::FiberScheduler;
use crate::store::ObjectStore;
use crate::token::TokenSystem;

pub struct Runtime {
    pub store: Arc<ObjectStore>,
    pub tokens: Arc<TokenSystem>,
    pub fibers: Arc<FiberScheduler>,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        let store = Arc::new(ObjectStore::new());
        let tokens = Arc::new(TokenSystem::new(store.clone()));
        let fibers = FiberScheduler::new();
        Arc::new(Self { store, tokens, fibers })
    }
}
