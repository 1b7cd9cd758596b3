//! Token system (spec.md §3.6, §4.4)
//!
//! Pure bookkeeping: allocation, parent/child/chain links, completion
//! state, and the brace coordinator's join-barrier counters. The actual
//! "resume means re-enter dispatch" behavior lives in `exec::executor`,
//! which is the layer that knows how to run a `PendingSequence` -- keeping
//! `TokenSystem` free of a dependency on the executor avoids a dispatch
//! hairball and matches spec.md §5's "never hold the executor mutex while
//! invoking a user handler" discipline: the mutex here only ever guards
//! plain data.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::exec::state::ExecutionState;
use crate::generator::LoopContinuation;
use crate::parser::ParsedCommand;
use crate::store::{ObjectKind, ObjectStore, StoredValue};
use crate::value::Value;

pub type TokenId = u64;

/// What kind of remaining-command continuation a token carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Sequence,
    Conditional,
    Or,
    Generator,
}

/// The remaining parsed commands to run once a token resumes, plus the
/// execution state they run in. `loop_continuation` is set instead of
/// (not alongside) an in-progress loop body: if present, resuming drives
/// that loop first (spec.md §4.6) before moving on to `remaining`.
pub struct PendingSequence {
    pub kind: SequenceKind,
    pub remaining: Vec<ParsedCommand>,
    pub state: Arc<Mutex<ExecutionState>>,
    pub loop_continuation: Option<Box<LoopContinuation>>,
}

/// Join-barrier bookkeeping for a set of parallel `{…}` sub-evaluations in
/// one argument slot (spec.md §4.2, §4.4).
pub struct BraceCoordinator {
    pub original_string: String,
    /// Byte ranges (in `original_string`) of each `{...}` group, in order.
    pub groups: Vec<(usize, usize)>,
    pub results: Vec<Option<String>>,
    pub completed: usize,
    pub has_failure: bool,
}

impl BraceCoordinator {
    pub fn new(original_string: String, groups: Vec<(usize, usize)>) -> Self {
        let n = groups.len();
        Self { original_string, groups, results: vec![None; n], completed: 0, has_failure: false }
    }

    /// Record one child's result. Returns the assembled string and overall
    /// success once every child has reported.
    pub fn resolve_child(&mut self, index: usize, text: String, success: bool) -> Option<(String, bool)> {
        self.results[index] = Some(text);
        self.completed += 1;
        if !success {
            self.has_failure = true;
        }
        if self.completed < self.groups.len() {
            return None;
        }
        let mut assembled = String::with_capacity(self.original_string.len());
        let mut cursor = 0usize;
        for (i, (start, end)) in self.groups.iter().enumerate() {
            assembled.push_str(&self.original_string[cursor..*start]);
            assembled.push_str(self.results[i].as_deref().unwrap_or(""));
            cursor = *end;
        }
        assembled.push_str(&self.original_string[cursor..]);
        Some((assembled, !self.has_failure))
    }
}

pub struct TokenData {
    pub id: TokenId,
    pub completed: bool,
    pub final_status: bool,
    pub final_result: Option<Value>,
    pub command_sequence: Option<PendingSequence>,
    pub parent_token: Option<TokenId>,
    pub children: HashSet<TokenId>,
    pub chained_token: Option<TokenId>,
    /// Set by a timeout watcher thread's cancellation; checked instead of
    /// an async task handle since fibers/timeouts here are plain OS
    /// threads, not tokio tasks.
    pub cancel_handle: Option<Arc<AtomicBool>>,
    pub timestamp: Instant,
    pub fiber_id: u64,
    pub brace_coordinator: Option<(TokenId, usize)>,
    pub wait_chan: Option<mpsc::Sender<(bool, Option<Value>)>>,
    pub invert_status: bool,
}

impl TokenData {
    fn new(id: TokenId, parent_token: Option<TokenId>, fiber_id: u64) -> Self {
        Self {
            id,
            completed: false,
            final_status: false,
            final_result: None,
            command_sequence: None,
            parent_token,
            children: HashSet::new(),
            chained_token: None,
            cancel_handle: None,
            timestamp: Instant::now(),
            fiber_id,
            brace_coordinator: None,
            wait_chan: None,
            invert_status: false,
        }
    }
}

/// Result of completing a token: what the executor layer needs to act on
/// next (forward to a chained token, notify a waiter, nothing).
pub struct CompletionInfo {
    pub status: bool,
    pub result: Option<Value>,
    pub chained_token: Option<TokenId>,
    pub wait_chan: Option<mpsc::Sender<(bool, Option<Value>)>>,
    pub fiber_id: u64,
}

pub struct TokenSystem {
    store: Arc<ObjectStore>,
    active: Mutex<HashMap<TokenId, TokenData>>,
}

impl TokenSystem {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store, active: Mutex::new(HashMap::new()) }
    }

    /// Allocate a token's heap id and register it. Refcount starts at 0;
    /// the caller must `claim` if it stores the token's marker anywhere.
    pub fn request_token(&self, parent: Option<TokenId>, fiber_id: u64) -> TokenId {
        let id = self.store.store_object(StoredValue::Token(0), ObjectKind::Token);
        self.store.set(id, StoredValue::Token(id));
        let mut active = self.active.lock().unwrap();
        active.insert(id, TokenData::new(id, parent, fiber_id));
        if let Some(p) = parent {
            if let Some(parent_data) = active.get_mut(&p) {
                parent_data.children.insert(id);
            }
        }
        id
    }

    pub fn claim(&self, token: TokenId) {
        self.store.claim(token);
    }

    pub fn attach_sequence(&self, token: TokenId, seq: PendingSequence) {
        if let Some(data) = self.active.lock().unwrap().get_mut(&token) {
            data.command_sequence = Some(seq);
        }
    }

    pub fn take_sequence(&self, token: TokenId) -> Option<PendingSequence> {
        self.active.lock().unwrap().get_mut(&token).and_then(|d| d.command_sequence.take())
    }

    pub fn set_cancel_handle(&self, token: TokenId, handle: Arc<AtomicBool>) {
        if let Some(data) = self.active.lock().unwrap().get_mut(&token) {
            data.cancel_handle = Some(handle);
        }
    }

    /// Spawn a watcher thread that force-cleans `token` if it is still
    /// active after `timeout` elapses (spec.md §4.4). Returns the flag the
    /// watcher checks on wake so `complete`/cleanup can cancel it early.
    pub fn arm_timeout(self: &Arc<Self>, token: TokenId, timeout: std::time::Duration) {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.set_cancel_handle(token, cancelled.clone());
        let ts = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            if !cancelled.load(Ordering::SeqCst) && !ts.is_completed(token) {
                ts.force_cleanup(token);
            }
        });
    }

    pub fn set_brace_coordinator(&self, token: TokenId, coordinator: TokenId, index: usize) {
        if let Some(data) = self.active.lock().unwrap().get_mut(&token) {
            data.brace_coordinator = Some((coordinator, index));
        }
    }

    pub fn brace_coordinator_of(&self, token: TokenId) -> Option<(TokenId, usize)> {
        self.active.lock().unwrap().get(&token).and_then(|d| d.brace_coordinator)
    }

    pub fn chain(&self, from: TokenId, to: TokenId) {
        if let Some(data) = self.active.lock().unwrap().get_mut(&from) {
            data.chained_token = Some(to);
        }
    }

    pub fn attach_wait_chan(&self, token: TokenId, tx: mpsc::Sender<(bool, Option<Value>)>) {
        // Migrate down the chain so the *tail* token signals the waiter.
        let mut current = token;
        let mut active = self.active.lock().unwrap();
        while let Some(next) = active.get(&current).and_then(|d| d.chained_token) {
            current = next;
        }
        if let Some(data) = active.get_mut(&current) {
            data.wait_chan = Some(tx);
        }
    }

    pub fn is_completed(&self, token: TokenId) -> bool {
        self.active.lock().unwrap().get(&token).map(|d| d.completed).unwrap_or(true)
    }

    pub fn invert_status(&self, token: TokenId, invert: bool) {
        if let Some(data) = self.active.lock().unwrap().get_mut(&token) {
            data.invert_status = invert;
        }
    }

    /// Mark `token` finally complete and remove it from `activeTokens`,
    /// freeing its heap cell if unclaimed. Returns what the executor layer
    /// must still do (forward to a chain, notify a waiter).
    pub fn complete(&self, token: TokenId, mut status: bool, result: Option<Value>) -> CompletionInfo {
        let (chained_token, wait_chan, fiber_id, invert) = {
            let mut active = self.active.lock().unwrap();
            let Some(mut data) = active.remove(&token) else {
                return CompletionInfo { status, result, chained_token: None, wait_chan: None, fiber_id: 0 };
            };
            data.completed = true;
            data.final_status = status;
            data.final_result = result.clone();
            if let Some(flag) = data.cancel_handle.take() {
                flag.store(true, Ordering::SeqCst);
            }
            (data.chained_token, data.wait_chan, data.fiber_id, data.invert_status)
        };
        if invert {
            status = !status;
        }
        if self.store.ref_count(token).unwrap_or(0) == 0 {
            self.store.force_delete(token);
        }
        CompletionInfo { status, result, chained_token, wait_chan, fiber_id }
    }

    /// `complete`, then signal any attached waiter directly -- the
    /// convenience most callers want instead of doing it by hand.
    pub fn complete_and_signal(&self, token: TokenId, status: bool, result: Option<Value>) -> CompletionInfo {
        let info = self.complete(token, status, result);
        if let Some(tx) = &info.wait_chan {
            let _ = tx.send((info.status, info.result.clone()));
        }
        info
    }

    /// Block the calling OS thread until `token` completes, per spec.md
    /// §6.1's synchronous top-level `execute()`: a handler that returns a
    /// token hands control back to the executor, which waits here before
    /// sequencing the next command.
    pub fn wait_blocking(&self, token: TokenId) -> (bool, Option<Value>) {
        {
            let active = self.active.lock().unwrap();
            match active.get(&token) {
                Some(data) if data.completed => return (data.final_status, data.final_result.clone()),
                None => return (true, None),
                _ => {}
            }
        }
        let (tx, rx) = mpsc::channel();
        self.attach_wait_chan(token, tx);
        rx.recv().unwrap_or((false, None))
    }

    /// Force-cleanup on timeout expiry: runs no handler callback (the
    /// executor layer is responsible for any cleanup callback registered
    /// out of band), removes the token, and signals `false` to any waiter.
    pub fn force_cleanup(&self, token: TokenId) {
        let (children, wait_chan) = {
            let mut active = self.active.lock().unwrap();
            let Some(data) = active.remove(&token) else { return };
            (data.children, data.wait_chan)
        };
        for child in children {
            self.force_cleanup(child);
        }
        self.store.force_delete(token);
        if let Some(tx) = wait_chan {
            let _ = tx.send((false, None));
        }
    }
}

#[derive(Clone)]
pub struct Channel {
    pub sender: mpsc::Sender<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_token_registers_parent_child_link() {
        let store = Arc::new(ObjectStore::new());
        let ts = TokenSystem::new(store);
        let parent = ts.request_token(None, 0);
        let child = ts.request_token(Some(parent), 0);
        assert!(ts.active.lock().unwrap().get(&parent).unwrap().children.contains(&child));
    }

    #[test]
    fn complete_frees_unclaimed_token() {
        let store = Arc::new(ObjectStore::new());
        let ts = TokenSystem::new(store.clone());
        let t = ts.request_token(None, 0);
        assert_eq!(store.len(), 1);
        ts.complete(t, true, None);
        assert!(store.is_empty());
    }

    #[test]
    fn brace_coordinator_joins_after_all_children() {
        let mut coord = BraceCoordinator::new("a {X} b {Y} c".to_string(), vec![(2, 5), (8, 11)]);
        assert!(coord.resolve_child(0, "1".into(), true).is_none());
        let (assembled, ok) = coord.resolve_child(1, "2".into(), true).unwrap();
        assert_eq!(assembled, "a 1 b 2 c");
        assert!(ok);
    }
}
