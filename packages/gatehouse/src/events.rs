//! Named-event publish/subscribe.
//!
//! Shared by the connection layer and by compiled-in extensions, so both can
//! observe the same events (`go:authenticate`, `go:broadcast`, ...).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// A subscriber. Identity (for [`EventDispatcher::off`]) is the `Arc`
/// allocation, so keep a clone of the `Arc` you registered.
pub type EventCallback<P> = Arc<dyn Fn(&P) -> anyhow::Result<()> + Send + Sync>;

struct Registration<P> {
    callback: EventCallback<P>,
    max_calls: Option<u64>,
    calls: AtomicU64,
}

impl<P> Registration<P> {
    /// Reserve one invocation. Fails once `max_calls` have been handed out,
    /// so concurrent triggers can never overshoot the limit.
    fn claim(&self) -> bool {
        self.calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |calls| match self.max_calls {
                Some(max) if calls >= max => None,
                _ => Some(calls + 1),
            })
            .is_ok()
    }

    fn exhausted(&self) -> bool {
        self.max_calls
            .is_some_and(|max| self.calls.load(Ordering::Acquire) >= max)
    }
}

fn same_callback<P>(a: &EventCallback<P>, b: &EventCallback<P>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Outcome of a single [`EventDispatcher::trigger`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub invoked: usize,
    pub failed: usize,
}

pub struct EventDispatcher<P> {
    registrations: Mutex<HashMap<String, Vec<Arc<Registration<P>>>>>,
}

impl<P> Default for EventDispatcher<P> {
    fn default() -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
        }
    }
}

impl<P> EventDispatcher<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to each of `events`. With `max_calls`, the
    /// registration removes itself after firing that many times.
    pub fn on(&self, events: &[&str], callback: EventCallback<P>, max_calls: Option<u64>) {
        let mut regs = self.registrations.lock();
        for event in events {
            regs.entry((*event).to_string())
                .or_default()
                .push(Arc::new(Registration {
                    callback: callback.clone(),
                    max_calls,
                    calls: AtomicU64::new(0),
                }));
        }
    }

    pub fn once(&self, events: &[&str], callback: EventCallback<P>) {
        self.on(events, callback, Some(1));
    }

    /// Remove every registration of `callback` under each of `events`.
    /// Returns how many were removed.
    pub fn off(&self, events: &[&str], callback: &EventCallback<P>) -> usize {
        let mut regs = self.registrations.lock();
        let mut removed = 0;
        for event in events {
            if let Some(list) = regs.get_mut(*event) {
                let before = list.len();
                list.retain(|r| !same_callback(&r.callback, callback));
                removed += before - list.len();
                if list.is_empty() {
                    regs.remove(*event);
                }
            }
        }
        removed
    }

    /// Invoke every subscriber of each event in registration order.
    ///
    /// The subscriber list is snapshotted before the pass, so callbacks may
    /// call `on`/`off`/`trigger` themselves. Exhausted registrations are
    /// pruned after the pass completes.
    pub fn trigger(&self, events: &[&str], payload: &P) -> TriggerOutcome {
        let mut outcome = TriggerOutcome::default();
        for event in events {
            let snapshot = match self.registrations.lock().get(*event) {
                Some(list) => list.clone(),
                None => continue,
            };

            for reg in &snapshot {
                if !reg.claim() {
                    continue;
                }
                outcome.invoked += 1;
                if let Err(e) = (reg.callback)(payload) {
                    outcome.failed += 1;
                    warn!(event = %event, error = %e, "Event callback failed");
                }
            }

            if snapshot.iter().any(|r| r.exhausted()) {
                let mut regs = self.registrations.lock();
                if let Some(list) = regs.get_mut(*event) {
                    list.retain(|r| !r.exhausted());
                    if list.is_empty() {
                        regs.remove(*event);
                    }
                }
            }
        }
        outcome
    }

    /// Number of live registrations for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.registrations.lock().get(event).map_or(0, Vec::len)
    }
}
