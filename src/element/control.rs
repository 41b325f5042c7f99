//! Element state machine and cooperative control token.
//!
//! Pause/resume/stop are requests, not preemption: the worker thread
//! observes the token at defined suspension points and reacts there.
//! Callers that need a bound use [`ControlToken::wait_for_state`] with a
//! timeout and treat expiry as "did not stop in time" — reported, never
//! assumed fatal.

use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle state of an element.
///
/// `Stopped`, `Finished` and `Error` are re-entrant, not permanently
/// terminal: a pipeline may run the element again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementState {
    /// Created, never run.
    Init,
    /// The worker thread is processing.
    Running,
    /// The worker thread is parked on a pause request.
    Paused,
    /// Stopped on request.
    Stopped,
    /// The stream completed cleanly.
    Finished,
    /// Processing failed.
    Error,
}

impl ElementState {
    /// True for the states a `run` transition restarts from.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ElementState::Stopped | ElementState::Finished | ElementState::Error
        )
    }

    /// True while the worker is inside a run (processing or paused).
    pub fn is_active(&self) -> bool {
        matches!(self, ElementState::Running | ElementState::Paused)
    }
}

/// What the control side is currently asking of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    Run,
    Pause,
    Stop,
    Terminate,
}

struct ControlSt {
    state: ElementState,
    directive: Directive,
    /// Bumped by every explicit run request; the worker only restarts out
    /// of a terminal state when it sees a fresh epoch, so a finished
    /// element does not spin back to life on a stale directive.
    run_epoch: u64,
    pending_seek: Option<u64>,
}

struct ControlInner {
    st: Mutex<ControlSt>,
    cond: Condvar,
}

/// Shared control handle between an element, its worker thread and the
/// pipeline. Cheap to clone.
#[derive(Clone)]
pub struct ControlToken {
    inner: Arc<ControlInner>,
}

impl ControlToken {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                st: Mutex::new(ControlSt {
                    state: ElementState::Init,
                    directive: Directive::Stop,
                    run_epoch: 0,
                    pending_seek: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Current state. A cross-thread read of this is eventually-consistent
    /// status, not a transactional guarantee.
    pub fn state(&self) -> ElementState {
        self.inner.st.lock().unwrap().state
    }

    pub(crate) fn set_state(&self, state: ElementState) {
        let mut st = self.inner.st.lock().unwrap();
        st.state = state;
        self.inner.cond.notify_all();
    }

    pub(crate) fn directive(&self) -> Directive {
        self.inner.st.lock().unwrap().directive
    }

    /// True once stop or terminate has been requested.
    pub(crate) fn interrupted(&self) -> bool {
        matches!(self.directive(), Directive::Stop | Directive::Terminate)
    }

    pub(crate) fn request(&self, directive: Directive) {
        let mut st = self.inner.st.lock().unwrap();
        st.directive = directive;
        self.inner.cond.notify_all();
    }

    /// Request a (re)start: sets the directive and bumps the run epoch.
    pub(crate) fn request_run(&self) {
        let mut st = self.inner.st.lock().unwrap();
        st.directive = Directive::Run;
        st.run_epoch += 1;
        self.inner.cond.notify_all();
    }

    pub(crate) fn request_seek(&self, pos: u64) {
        let mut st = self.inner.st.lock().unwrap();
        st.pending_seek = Some(pos);
        self.inner.cond.notify_all();
    }

    pub(crate) fn take_seek(&self) -> Option<u64> {
        self.inner.st.lock().unwrap().pending_seek.take()
    }

    /// Worker side: park until a run epoch newer than `seen` arrives
    /// (returns it) or terminate is requested (returns `None`).
    pub(crate) fn wait_new_run(&self, seen: u64) -> Option<u64> {
        let mut st = self.inner.st.lock().unwrap();
        loop {
            if st.directive == Directive::Terminate {
                return None;
            }
            if st.run_epoch != seen && st.directive == Directive::Run {
                return Some(st.run_epoch);
            }
            st = self.inner.cond.wait(st).unwrap();
        }
    }

    /// Worker side: block while the directive equals `from`, return the
    /// directive that replaced it.
    pub(crate) fn wait_directive_change(&self, from: Directive) -> Directive {
        let mut st = self.inner.st.lock().unwrap();
        while st.directive == from {
            st = self.inner.cond.wait(st).unwrap();
        }
        st.directive
    }

    /// Wait until the state satisfies `pred`, bounded by `timeout`.
    pub fn wait_for_state(
        &self,
        pred: impl Fn(ElementState) -> bool,
        timeout: Option<Duration>,
    ) -> Result<ElementState> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.inner.st.lock().unwrap();
        loop {
            if pred(st.state) {
                return Ok(st.state);
            }
            st = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.inner.cond.wait_timeout(st, deadline - now).unwrap().0
                }
                None => self.inner.cond.wait(st).unwrap(),
            };
        }
    }
}

impl std::fmt::Debug for ControlToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.st.lock().unwrap();
        f.debug_struct("ControlToken")
            .field("state", &st.state)
            .field("directive", &st.directive)
            .field("run_epoch", &st.run_epoch)
            .finish()
    }
}
