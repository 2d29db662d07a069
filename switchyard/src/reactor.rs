// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The event demultiplexing interface consumed by the hub.
//!
//! The core never polls file descriptors itself; it arms oneshot readiness
//! and timer events against an implementation of [`Reactor`] and lets the
//! driver loop call [`Reactor::dispatch`]. The default backend lives in the
//! `switchyard-mio` crate.

use core::fmt;
use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// Readiness bits passed to an event callback when it fires.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// The event's deadline expired before the fd became ready. Timer
        /// events always fire with this bit set.
        const TIMEOUT = 1 << 2;
        const SIGNAL = 1 << 3;
    }
}

/// Outcome of one demultiplex round.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// The round completed; callbacks may or may not have fired.
    Dispatched,
    /// No events are registered. The driver loop terminates cleanly.
    Exhausted,
    /// An external stop request was observed. The request is consumed; the
    /// next round runs normally.
    Stopped,
}

/// Oneshot event callback. Runs in the driver context and must not suspend.
pub type Callback = Box<dyn FnOnce(&EventRef, EventFlags)>;

/// Persistent signal callback. Runs in the driver context once per delivery.
pub type SignalCallback = Box<dyn FnMut(EventFlags)>;

/// The reactor interface.
///
/// `timer`, `read_event`, `write_event` and `readwrite_event` arm oneshot
/// events: the callback fires at most once, with [`EventFlags::TIMEOUT`] set
/// when the optional deadline expired first. `signal` registrations are
/// persistent and do not count toward exhaustion.
pub trait Reactor {
    /// Arm a timer firing once after `delay`. A zero delay fires on the next
    /// dispatch round.
    fn timer(&self, delay: Duration, cb: Callback) -> EventRef;

    /// Arm a oneshot fd-readable event.
    ///
    /// # Errors
    ///
    /// Fails when the fd cannot be registered with the demultiplexer.
    fn read_event(&self, fd: RawFd, timeout: Option<Duration>, cb: Callback)
    -> io::Result<EventRef>;

    /// Arm a oneshot fd-writable event.
    ///
    /// # Errors
    ///
    /// Fails when the fd cannot be registered with the demultiplexer.
    fn write_event(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> io::Result<EventRef>;

    /// Arm a oneshot event firing when the fd becomes readable or writable,
    /// whichever happens first.
    ///
    /// # Errors
    ///
    /// Fails when the fd cannot be registered with the demultiplexer.
    fn readwrite_event(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> io::Result<EventRef>;

    /// Register a persistent handler for an OS signal.
    ///
    /// # Errors
    ///
    /// Fails when the signal cannot be watched on this platform.
    fn signal(&self, signum: i32, cb: SignalCallback) -> io::Result<EventRef>;

    /// Run one demultiplex round: wait for readiness or the next deadline,
    /// then fire the due callbacks.
    ///
    /// # Errors
    ///
    /// Propagates demultiplexer failures; the driver loop terminates on them.
    fn dispatch(&self) -> io::Result<Dispatch>;

    /// Request that the next dispatch round reports [`Dispatch::Stopped`].
    fn stop(&self);

    /// Re-arm kernel state after `fork`: recreate the demultiplexer and
    /// re-register the live interests with it.
    ///
    /// # Errors
    ///
    /// Fails when the fresh demultiplexer cannot be created or re-armed.
    fn reinit(&self) -> io::Result<()>;

    /// Number of armed oneshot events (signal registrations excluded).
    fn pending(&self) -> usize;
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an armed reactor event.
///
/// Fires at most once; [`EventRef::cancel`] is idempotent and safe to call
/// after the event fired. The id is unique per process and is what wait
/// primitives compare to detect stray switches.
#[derive(Clone)]
pub struct EventRef(Rc<EventInner>);

struct EventInner {
    id: u64,
    cancelled: Cell<bool>,
    hook: Cell<Option<Box<dyn FnOnce()>>>,
}

impl EventRef {
    /// Create a handle whose cancellation runs `hook` (at most once).
    ///
    /// Backends call this when arming; the hook removes the registration
    /// from the backend's bookkeeping.
    pub fn new(hook: Box<dyn FnOnce()>) -> Self {
        Self(Rc::new(EventInner {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: Cell::new(false),
            hook: Cell::new(Some(hook)),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Cancel the registration. Idempotent; a no-op once the event fired.
    pub fn cancel(&self) {
        self.0.cancelled.set(true);
        if let Some(hook) = self.0.hook.take() {
            tracing::trace!(event = self.0.id, "event cancelled");
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.get()
    }

    /// Detach the cancellation hook just before firing, so a cancel from
    /// inside a callback of the same round no longer reaches backend state.
    ///
    /// Returns `false` when the event was already cancelled; the backend
    /// must then drop the callback unfired.
    pub fn disarm(&self) -> bool {
        drop(self.0.hook.take());
        !self.0.cancelled.get()
    }
}

impl fmt::Debug for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRef")
            .field("id", &self.0.id)
            .field("cancelled", &self.0.cancelled.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn cancel_is_idempotent() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let ev = EventRef::new(Box::new(move || c.set(c.get() + 1)));

        ev.cancel();
        ev.cancel();

        assert!(ev.is_cancelled());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn disarm_suppresses_the_hook() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let ev = EventRef::new(Box::new(move || l.borrow_mut().push("hook")));

        assert!(ev.disarm());
        ev.cancel();

        assert!(ev.is_cancelled());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn disarm_reports_prior_cancellation() {
        let ev = EventRef::new(Box::new(|| {}));
        ev.cancel();
        assert!(!ev.disarm());
    }
}
