// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wait primitives: the only low-level suspension points exposed to tasks.
//!
//! Each primitive arms exactly one reactor event whose callback either
//! resumes the waiter with the event's own handle or, on expiry, throws the
//! caller-supplied timeout error into it. The armed event is cancelled on
//! every exit path. A task has at most one wait outstanding; resuming a wait
//! with a foreign event handle is a bug and trips the stray-switch
//! assertion.

use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::hub::{Hub, current_task};
use crate::reactor::{Callback, EventFlags, EventRef};
use crate::task::{Resumption, TaskState};
use crate::{Error, Result};

const NO_HUB: &str = "no hub is running on this thread";
const NOT_IN_TASK: &str = "wait primitives may only be called from a task, not from the dispatch loop";

/// Suspend until `fd` is readable.
///
/// `timeout` of `None` waits forever; a zero timeout is permitted and fires
/// on the next dispatch round. On expiry `timeout_exc` is returned as the
/// error.
///
/// # Errors
///
/// `timeout_exc` on expiry; any failure thrown into the task while it waits.
///
/// # Panics
///
/// Panics when called from the dispatch loop or outside a driver loop.
pub async fn wait_read(fd: RawFd, timeout: Option<Duration>, timeout_exc: Error) -> Result<()> {
    let hub = Hub::current().expect(NO_HUB);
    let task = current_task().expect(NOT_IN_TASK);
    let event = hub
        .reactor()
        .read_event(fd, timeout, waiter(task.clone(), timeout_exc))?;
    switch(task, event, "wait_read").await
}

/// Suspend until `fd` is writable. See [`wait_read`].
///
/// # Errors
///
/// `timeout_exc` on expiry; any failure thrown into the task while it waits.
///
/// # Panics
///
/// Panics when called from the dispatch loop or outside a driver loop.
pub async fn wait_write(fd: RawFd, timeout: Option<Duration>, timeout_exc: Error) -> Result<()> {
    let hub = Hub::current().expect(NO_HUB);
    let task = current_task().expect(NOT_IN_TASK);
    let event = hub
        .reactor()
        .write_event(fd, timeout, waiter(task.clone(), timeout_exc))?;
    switch(task, event, "wait_write").await
}

/// Suspend until `fd` is readable or writable, whichever happens first.
/// See [`wait_read`].
///
/// # Errors
///
/// `timeout_exc` on expiry; any failure thrown into the task while it waits.
///
/// # Panics
///
/// Panics when called from the dispatch loop or outside a driver loop.
pub async fn wait_readwrite(fd: RawFd, timeout: Option<Duration>, timeout_exc: Error) -> Result<()> {
    let hub = Hub::current().expect(NO_HUB);
    let task = current_task().expect(NOT_IN_TASK);
    let event = hub
        .reactor()
        .readwrite_event(fd, timeout, waiter(task.clone(), timeout_exc))?;
    switch(task, event, "wait_readwrite").await
}

/// Yield to other tasks until at least `duration` has elapsed.
///
/// `sleep(Duration::ZERO)` is the canonical cooperative yield: it reschedules
/// the task behind every event already due.
///
/// # Errors
///
/// Any failure thrown into the task while it sleeps (a kill or an enclosing
/// timeout scope).
///
/// # Panics
///
/// Panics when called from the dispatch loop or outside a driver loop.
pub async fn sleep(duration: Duration) -> Result<()> {
    let hub = Hub::current().expect(NO_HUB);
    let task = current_task().expect(NOT_IN_TASK);
    let target = task.clone();
    let event = hub.reactor().timer(
        duration,
        Box::new(move |event, _flags| target.resume(event.clone())),
    );
    switch(task, event, "sleep").await
}

/// The helper callback armed by every fd wait: timeout throws, readiness
/// resumes the waiter with the event handle.
fn waiter(task: Rc<TaskState>, timeout_exc: Error) -> Callback {
    Box::new(move |event, flags| {
        if flags.contains(EventFlags::TIMEOUT) {
            task.throw(timeout_exc);
        } else {
            task.resume(event.clone());
        }
    })
}

/// Transfer control to the hub until `armed` resumes us, then check the
/// resumption against the event we armed.
async fn switch(task: Rc<TaskState>, armed: EventRef, what: &'static str) -> Result<()> {
    let got = Switch::new(task, armed.clone()).await?;
    assert!(
        got.id() == armed.id(),
        "stray switch into {what}: resumed by event {} while waiting for event {}",
        got.id(),
        armed.id(),
    );
    Ok(())
}

/// The switch boundary: consumes the task's resumption slot.
///
/// Dropping a `Switch` cancels the armed event, which covers every exit
/// path: normal completion, timeout, and a foreign throw that unwinds the
/// wait.
struct Switch {
    task: Rc<TaskState>,
    armed: EventRef,
}

// === impl Switch ===

impl Switch {
    fn new(task: Rc<TaskState>, armed: EventRef) -> Self {
        task.run_switch_out();
        tracing::trace!(task = %task.id(), event = armed.id(), "switching out");
        Self { task, armed }
    }
}

impl Future for Switch {
    type Output = Result<EventRef>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.task.take_resumption() {
            None => Poll::Pending,
            Some(Resumption::Event(event)) => Poll::Ready(Ok(event)),
            Some(Resumption::Throw(err)) => Poll::Ready(Err(err)),
        }
    }
}

impl Drop for Switch {
    fn drop(&mut self) {
        self.armed.cancel();
    }
}
