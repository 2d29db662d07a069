// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task state and resumption.
//!
//! A task is an independently schedulable unit of work modeled as a pinned
//! future with output `Result<()>`. Exactly one task executes at any
//! instant; a task suspends by returning `Pending` from a wait primitive
//! and is resumed when a reactor callback delivers a [`Resumption`] to it
//! and polls it. Both halves of the transfer run on the hub's thread.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::mem::ManuallyDrop;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use crate::Result;
use crate::error::Killed;
use crate::hub::{self, Hub};

/// Unique task identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// What a suspended task is resumed with, consumed at the switch boundary.
pub(crate) enum Resumption {
    /// Normal resumption carrying the armed event's handle.
    Event(crate::reactor::EventRef),
    /// Exception injection: the innermost wait returns this as an error.
    Throw(crate::Error),
}

impl fmt::Debug for Resumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resumption::Event(ev) => f.debug_tuple("Event").field(&ev.id()).finish(),
            Resumption::Throw(err) => f.debug_tuple("Throw").field(&format_args!("{err}")).finish(),
        }
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

pub(crate) enum TaskBody {
    /// Body owned by the task itself; polled from reactor callbacks.
    Spawned(RefCell<Option<TaskFuture>>),
    /// The `block_on` future lives on the driver's stack; resuming the main
    /// task only marks it woken and the driver loop polls it.
    Main,
}

pub(crate) struct TaskState {
    id: TaskId,
    hub: Weak<Hub>,
    body: TaskBody,
    resumption: RefCell<Option<Resumption>>,
    alive: Cell<bool>,
    started: Cell<bool>,
    woken: Cell<bool>,
    switch_out: RefCell<Option<Box<dyn FnMut() -> Result<()>>>>,
    span: tracing::Span,
}

// === impl TaskState ===

impl TaskState {
    pub(crate) fn new_spawned(hub: Weak<Hub>, future: TaskFuture) -> Rc<Self> {
        let id = TaskId::next();
        Rc::new(Self {
            id,
            hub,
            body: TaskBody::Spawned(RefCell::new(Some(future))),
            resumption: RefCell::new(None),
            alive: Cell::new(true),
            started: Cell::new(false),
            woken: Cell::new(false),
            switch_out: RefCell::new(None),
            span: tracing::trace_span!("task", task.id = id.as_u64()),
        })
    }

    pub(crate) fn new_main(hub: Weak<Hub>) -> Rc<Self> {
        let id = TaskId::next();
        Rc::new(Self {
            id,
            hub,
            body: TaskBody::Main,
            resumption: RefCell::new(None),
            alive: Cell::new(true),
            started: Cell::new(true),
            woken: Cell::new(false),
            switch_out: RefCell::new(None),
            span: tracing::trace_span!("task", task.id = id.as_u64(), task.main = true),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub(crate) fn kill_switch(&self) {
        self.alive.set(false);
    }

    /// Resume the task normally with the handle of the event that fired.
    pub(crate) fn resume(self: &Rc<Self>, event: crate::reactor::EventRef) {
        if !self.alive.get() {
            tracing::trace!(task = %self.id, event = event.id(), "resume on a dead task dropped");
            return;
        }
        {
            let mut slot = self.resumption.borrow_mut();
            if slot.is_some() {
                // a throw landed in the same round; the wait consuming it
                // will cancel this event's registration
                tracing::trace!(task = %self.id, event = event.id(), "resumption slot occupied, resume dropped");
                return;
            }
            *slot = Some(Resumption::Event(event));
        }
        self.deliver();
    }

    /// Inject a failure; the task's innermost wait returns it as an error.
    pub(crate) fn throw(self: &Rc<Self>, err: crate::Error) {
        if !self.alive.get() {
            tracing::trace!(task = %self.id, %err, "throw on a dead task dropped");
            return;
        }
        {
            let mut slot = self.resumption.borrow_mut();
            if slot.is_some() {
                tracing::trace!(task = %self.id, %err, "resumption slot occupied, throw dropped");
                return;
            }
            *slot = Some(Resumption::Throw(err));
        }
        self.deliver();
    }

    fn deliver(self: &Rc<Self>) {
        match &self.body {
            TaskBody::Spawned(_) => self.poll(),
            TaskBody::Main => {
                if let Some(hub) = self.hub.upgrade() {
                    hub.set_main_woken();
                }
            }
        }
    }

    /// Poll the task's own future once. Runs in the driver context.
    pub(crate) fn poll(self: &Rc<Self>) {
        if !self.alive.get() {
            return;
        }

        if !self.started.replace(true) {
            // a kill delivered before the first run ends the task without
            // ever polling its body
            let thrown = {
                let mut slot = self.resumption.borrow_mut();
                match slot.take() {
                    Some(Resumption::Throw(err)) => Some(err),
                    other => {
                        *slot = other;
                        None
                    }
                }
            };
            if let Some(err) = thrown {
                self.finish(Err(err));
                return;
            }
        }

        let TaskBody::Spawned(cell) = &self.body else {
            if let Some(hub) = self.hub.upgrade() {
                hub.set_main_woken();
            }
            return;
        };

        let _entered = self.span.enter();
        let waker = waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let mut slot = cell.borrow_mut();
            let Some(future) = slot.as_mut() else { return };
            let _guard = hub::enter_task(self.clone());
            future.as_mut().poll(&mut cx)
        };

        if let Poll::Ready(result) = poll {
            self.finish(result);
        }
    }

    fn finish(self: &Rc<Self>, result: Result<()>) {
        self.alive.set(false);
        if let TaskBody::Spawned(cell) = &self.body {
            cell.borrow_mut().take();
        }
        match result {
            Ok(()) => tracing::trace!(task = %self.id, "task finished"),
            Err(err) if err.is::<Killed>() => {
                tracing::trace!(task = %self.id, "task killed");
            }
            Err(err) => {
                tracing::debug!(task = %self.id, %err, "uncaught task failure");
                if let Some(hub) = self.hub.upgrade() {
                    // propagates to the parent: surfaces as the driver's error
                    hub.record_crash(err);
                } else {
                    tracing::error!(task = %self.id, "task failure with no hub to report to");
                }
            }
        }
    }

    pub(crate) fn take_resumption(&self) -> Option<Resumption> {
        self.resumption.borrow_mut().take()
    }

    pub(crate) fn set_switch_out(&self, hook: Box<dyn FnMut() -> Result<()>>) {
        *self.switch_out.borrow_mut() = Some(hook);
    }

    /// Run the task's `switch_out` hook, if any. A hook failure is logged
    /// and does not prevent the switch.
    pub(crate) fn run_switch_out(&self) {
        let mut hook = self.switch_out.borrow_mut();
        if let Some(hook) = hook.as_mut() {
            if let Err(err) = hook() {
                tracing::error!(task = %self.id, %err, "switch_out hook failed");
            }
        }
    }

    /// Foreign wake: schedule a plain repoll through a zero-delay timer.
    /// The resumption slot is left untouched, so pending waits stay pending.
    fn wake(self: &Rc<Self>) {
        if !self.alive.get() || self.woken.replace(true) {
            return;
        }
        let Some(hub) = self.hub.upgrade() else { return };
        let task = self.clone();
        hub.reactor().timer(
            Duration::ZERO,
            Box::new(move |_event, _flags| {
                task.woken.set(false);
                task.poll();
            }),
        );
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskState")
            .field("id", &self.id)
            .field("alive", &self.alive.get())
            .field("started", &self.started.get())
            .finish()
    }
}

// === impl TaskHandle ===

/// Owner-side handle to a spawned task, used to observe liveness and to
/// target [`crate::kill`].
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) state: Rc<TaskState>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.state.id()
    }

    /// Whether the task has neither completed nor failed yet. A task that
    /// has not started is alive.
    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    /// Install a hook invoked every time the task switches out to the hub.
    pub fn set_switch_out<F>(&self, hook: F)
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.state.set_switch_out(Box::new(hook));
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.state.id())
            .field("alive", &self.state.is_alive())
            .finish()
    }
}

// === Waker vtable methods ===
//
// The runtime itself resumes tasks through reactor callbacks and never goes
// through a `Waker`, but task bodies may await foreign futures that do. The
// waker re-schedules the task with a zero-delay timer. It is built over an
// `Rc` and is only sound while it stays on the hub's thread; nothing in this
// crate hands it to another thread.

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

pub(crate) fn waker(task: Rc<TaskState>) -> Waker {
    let raw = RawWaker::new(Rc::into_raw(task).cast::<()>(), &VTABLE);
    // Safety: the vtable functions uphold the RawWaker contract for the
    // Rc<TaskState> pointer created above; see the individual comments.
    unsafe { Waker::from_raw(raw) }
}

unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
    // Safety: `ptr` came from `Rc::into_raw` in `waker` or `clone_raw`; the
    // count is incremented so both the original and the clone own a ref.
    unsafe { Rc::increment_strong_count(ptr.cast::<TaskState>()) };
    RawWaker::new(ptr, &VTABLE)
}

unsafe fn wake_raw(ptr: *const ()) {
    // Safety: consumes the reference owned by this RawWaker.
    let task = unsafe { Rc::from_raw(ptr.cast::<TaskState>()) };
    task.wake();
}

unsafe fn wake_by_ref_raw(ptr: *const ()) {
    // Safety: borrows the reference owned by this RawWaker without
    // consuming it; ManuallyDrop keeps the count unchanged.
    let task = unsafe { ManuallyDrop::new(Rc::from_raw(ptr.cast::<TaskState>())) };
    task.wake();
}

unsafe fn drop_raw(ptr: *const ()) {
    // Safety: consumes the reference owned by this RawWaker.
    drop(unsafe { Rc::from_raw(ptr.cast::<TaskState>()) });
}
