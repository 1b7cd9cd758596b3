//! Fiber scheduler (spec.md §4.5)
//!
//! Each fiber is a genuine OS thread (not a green thread) running its own
//! command sequence to completion -- "true OS-level parallelism between
//! fibers" per spec.md, with the token system providing the cooperative
//! suspension *within* a single sequence. Bubbles a fiber raises but never
//! retrieves before finishing become orphans: collected for `bubble_orphans`
//! and logged once at scheduler teardown (spec.md's Open Question on orphan
//! bubbles is resolved as both sinks, see DESIGN.md).

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::value::Value;

thread_local! {
    static CURRENT_FIBER: Cell<u64> = const { Cell::new(0) };
}

pub fn current_fiber_id() -> u64 {
    CURRENT_FIBER.with(|c| c.get())
}

struct FiberState {
    join: Option<JoinHandle<()>>,
    completed: bool,
    status: bool,
    result: Option<Value>,
}

pub struct FiberScheduler {
    next_id: Mutex<u64>,
    fibers: Mutex<HashMap<u64, FiberState>>,
    orphan_bubbles: Mutex<Vec<(String, Value, u64)>>,
}

impl FiberScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { next_id: Mutex::new(0), fibers: Mutex::new(HashMap::new()), orphan_bubbles: Mutex::new(Vec::new()) })
    }

    /// Spawn a fiber. `body` returns its final status, result value, and
    /// any bubbles still unretrieved when it finished -- those become
    /// orphans.
    pub fn spawn<F>(self: &Arc<Self>, body: F) -> u64
    where
        F: FnOnce(u64) -> (bool, Option<Value>, Vec<(String, Value)>) + Send + 'static,
    {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.fibers.lock().unwrap().insert(id, FiberState { join: None, completed: false, status: false, result: None });

        let scheduler = self.clone();
        let handle = std::thread::spawn(move || {
            CURRENT_FIBER.with(|c| c.set(id));
            let (status, result, bubbles) = body(id);
            let mut orphans = scheduler.orphan_bubbles.lock().unwrap();
            for (flavor, v) in bubbles {
                orphans.push((flavor, v, id));
            }
            drop(orphans);
            let mut fibers = scheduler.fibers.lock().unwrap();
            if let Some(state) = fibers.get_mut(&id) {
                state.completed = true;
                state.status = status;
                state.result = result;
            }
        });
        if let Some(state) = self.fibers.lock().unwrap().get_mut(&id) {
            state.join = Some(handle);
        }
        id
    }

    pub fn wait(&self, id: u64) -> Option<(bool, Option<Value>)> {
        let handle = self.fibers.lock().unwrap().get_mut(&id).and_then(|s| s.join.take());
        if let Some(h) = handle {
            let _ = h.join();
        }
        self.fibers.lock().unwrap().get(&id).map(|s| (s.status, s.result.clone()))
    }

    pub fn wait_all(&self) -> Vec<u64> {
        let ids: Vec<u64> = self.fibers.lock().unwrap().keys().copied().collect();
        for id in &ids {
            self.wait(*id);
        }
        ids
    }

    pub fn count(&self) -> usize {
        self.fibers.lock().unwrap().values().filter(|s| !s.completed).count()
    }

    /// Drain orphan bubbles matching `flavor`, raised by any fiber that has
    /// already completed.
    pub fn bubble_orphans(&self, flavor: &str) -> Vec<Value> {
        let mut orphans = self.orphan_bubbles.lock().unwrap();
        let mut matching = Vec::new();
        orphans.retain(|(f, v, _)| {
            if f == flavor {
                matching.push(v.clone());
                false
            } else {
                true
            }
        });
        matching
    }
}

impl Drop for FiberScheduler {
    fn drop(&mut self) {
        let orphans = self.orphan_bubbles.lock().unwrap();
        for (flavor, value, fiber_id) in orphans.iter() {
            log::warn!("orphan bubble '{flavor}' from fiber {fiber_id} never retrieved: {value}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_wait_returns_result() {
        let sched = FiberScheduler::new();
        let id = sched.spawn(|_id| (true, Some(Value::Int(42)), Vec::new()));
        let (status, result) = sched.wait(id).unwrap();
        assert!(status);
        assert_eq!(result, Some(Value::Int(42)));
    }

    #[test]
    fn unretrieved_bubbles_become_orphans() {
        let sched = FiberScheduler::new();
        let id = sched.spawn(|_id| (true, None, vec![("warn".to_string(), Value::Str("late".into()))]));
        sched.wait(id);
        let orphans = sched.bubble_orphans("warn");
        assert_eq!(orphans.len(), 1);
        assert!(sched.bubble_orphans("warn").is_empty());
    }
}
