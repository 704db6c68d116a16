//! Admission control: host-wide and per-caller concurrency caps with a bounded FIFO wait queue.
//!
//! All counters live behind one mutex; waiters park on a condvar and are
//! served in arrival order among those whose caller is under its own cap.
use crate::config::service::ServiceConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound on one condvar sleep so cancellation is noticed promptly
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission queue full ({depth} waiting)")]
    QueueFull { depth: usize },
    #[error("no capacity within {waited:?}")]
    Timeout { waited: Duration },
    #[error("request cancelled while waiting for admission")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    pub global_limit: usize,
    pub per_caller_limit: usize,
    pub max_queue_depth: usize,
    pub timeout: Duration,
}

impl AdmissionLimits {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            global_limit: config.global_limit,
            per_caller_limit: config.per_caller_limit,
            max_queue_depth: config.max_queue_depth,
            timeout: config.admission_timeout(),
        }
    }
}

/// Point-in-time view of the controller, for health and metrics
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub in_use: usize,
    pub queued: usize,
    pub active_callers: usize,
    pub issued: u64,
    pub released: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct State {
    in_use: usize,
    per_caller: HashMap<String, usize>,
    queue: VecDeque<(u64, String)>,
    next_waiter: u64,
    issued: u64,
    released: u64,
    rejected: u64,
}

#[derive(Debug)]
struct Inner {
    limits: AdmissionLimits,
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Counters stay consistent under every critical section, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn eligible(&self, state: &State, caller: &str) -> bool {
        state.in_use < self.limits.global_limit
            && state.per_caller.get(caller).copied().unwrap_or(0) < self.limits.per_caller_limit
    }

    /// The first eligible waiter in arrival order (or a newcomer if none ahead is eligible)
    fn is_next(&self, state: &State, waiter: Option<u64>, caller: &str) -> bool {
        if !self.eligible(state, caller) {
            return false;
        }
        state
            .queue
            .iter()
            .take_while(|(id, _)| Some(*id) != waiter)
            .all(|(_, other)| !self.eligible(state, other))
    }

    fn grant(&self, state: &mut State, caller: &str) {
        state.in_use += 1;
        *state.per_caller.entry(caller.to_string()).or_insert(0) += 1;
        state.issued += 1;
    }

    fn release(&self, caller: &str) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if let Some(count) = state.per_caller.get_mut(caller) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_caller.remove(caller);
            }
        }
        state.released += 1;
        drop(state);
        self.wakeup.notify_all();
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits,
                state: Mutex::new(State::default()),
                wakeup: Condvar::new(),
            }),
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.inner.limits
    }

    /// Take a slot for `caller`, waiting up to the admission timeout.
    pub fn admit(&self, caller: &str, cancel: Option<&AtomicBool>) -> Result<AdmissionTicket, AdmissionError> {
        let inner = &self.inner;
        let mut state = inner.lock();

        if inner.is_next(&state, None, caller) {
            inner.grant(&mut state, caller);
            return Ok(self.ticket(caller));
        }

        if state.queue.len() >= inner.limits.max_queue_depth {
            state.rejected += 1;
            let depth = state.queue.len();
            log::warn!("Admission rejected for '{}': queue full ({})", caller, depth);
            return Err(AdmissionError::QueueFull { depth });
        }

        let waiter = state.next_waiter;
        state.next_waiter += 1;
        state.queue.push_back((waiter, caller.to_string()));
        let started = Instant::now();

        let outcome = loop {
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                break Err(AdmissionError::Cancelled);
            }
            if inner.is_next(&state, Some(waiter), caller) {
                break Ok(());
            }
            let waited = started.elapsed();
            if waited >= inner.limits.timeout {
                break Err(AdmissionError::Timeout { waited });
            }
            let slice = (inner.limits.timeout - waited).min(CANCEL_POLL);
            state = inner
                .wakeup
                .wait_timeout(state, slice)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        };

        state.queue.retain(|(id, _)| *id != waiter);
        match outcome {
            Ok(()) => {
                inner.grant(&mut state, caller);
                drop(state);
                // Leaving the queue may make the next waiter eligible
                inner.wakeup.notify_all();
                Ok(self.ticket(caller))
            }
            Err(e) => {
                state.rejected += 1;
                drop(state);
                inner.wakeup.notify_all();
                log::warn!("Admission rejected for '{}': {}", caller, e);
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.inner.lock();
        AdmissionSnapshot {
            in_use: state.in_use,
            queued: state.queue.len(),
            active_callers: state.per_caller.len(),
            issued: state.issued,
            released: state.released,
            rejected: state.rejected,
        }
    }

    fn ticket(&self, caller: &str) -> AdmissionTicket {
        AdmissionTicket {
            inner: Arc::clone(&self.inner),
            caller: caller.to_string(),
            consumed: AtomicBool::new(false),
        }
    }
}

/// A granted slot. Released exactly once, explicitly or on drop.
#[derive(Debug)]
pub struct AdmissionTicket {
    inner: Arc<Inner>,
    caller: String,
    consumed: AtomicBool,
}

impl AdmissionTicket {
    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn is_released(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Returns true only for the call that actually released the slot.
    pub fn release(&self) -> bool {
        if self.consumed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.release(&self.caller);
        true
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.release();
    }
}
