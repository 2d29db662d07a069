// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The hub: per-thread owner of the reactor and the driver loop.
//!
//! All tasks on a thread share one hub. The driver loop ([`Hub::block_on`])
//! plays the role of the driver task: it polls the main future when it has
//! been resumed, surfaces uncaught task failures, and otherwise runs reactor
//! dispatch rounds. Reactor callbacks execute in the driver's context and
//! resume exactly one task each; control returns to the driver when that
//! task next suspends.

use std::cell::{Cell, RefCell};
use std::io;
use std::pin::pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use static_assertions::assert_not_impl_any;

use crate::error::{Exhausted, Interrupt, Killed, Stopped};
use crate::reactor::{Dispatch, Reactor, SignalCallback};
use crate::task::{TaskHandle, TaskState};
use crate::{Error, Result};

thread_local! {
    static CURRENT_HUB: RefCell<Option<Rc<Hub>>> = const { RefCell::new(None) };
    static CURRENT_TASK: RefCell<Option<Rc<TaskState>>> = const { RefCell::new(None) };
}

pub struct Hub {
    reactor: Rc<dyn Reactor>,
    running: Cell<bool>,
    main: RefCell<Option<Rc<TaskState>>>,
    main_woken: Cell<bool>,
    crash: RefCell<Option<Error>>,
    sigint: RefCell<Option<crate::reactor::EventRef>>,
}

// One hub per thread; nothing here may cross threads.
assert_not_impl_any!(Hub: Send, Sync);

// === impl Hub ===

impl Hub {
    pub fn new(reactor: Rc<dyn Reactor>) -> Rc<Self> {
        Rc::new(Self {
            reactor,
            running: Cell::new(false),
            main: RefCell::new(None),
            main_woken: Cell::new(false),
            crash: RefCell::new(None),
            sigint: RefCell::new(None),
        })
    }

    /// The hub whose driver loop is running on this thread, if any.
    pub fn current() -> Option<Rc<Hub>> {
        CURRENT_HUB.with(|slot| slot.borrow().clone())
    }

    pub fn reactor(&self) -> &Rc<dyn Reactor> {
        &self.reactor
    }

    /// Request that the driver loop stops at the next dispatch round.
    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// Drive the reactor until `main` completes.
    ///
    /// This is the driver task. It exits when the main future resolves, when
    /// a spawned task fails with an uncaught error (the failure propagates
    /// here, to the parent), when dispatch runs out of registered events
    /// ([`Exhausted`]), on an external stop request ([`Stopped`]), or on a
    /// reactor error. The hub stays usable after any exit; the next call
    /// starts a fresh driver over the same reactor and its surviving
    /// registrations.
    ///
    /// # Errors
    ///
    /// Whatever `main` resolves to, plus the driver exits described above.
    ///
    /// # Panics
    ///
    /// Panics when a driver loop is already running on this thread.
    pub fn block_on<F, T>(self: &Rc<Self>, main: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        assert!(
            !self.running.get() && Self::current().is_none(),
            "a driver loop is already running on this thread"
        );

        let _hub = HubGuard::enter(self.clone());
        self.install_sigint();

        let main_task = TaskState::new_main(Rc::downgrade(self));
        *self.main.borrow_mut() = Some(main_task.clone());
        let _main = MainGuard { hub: self.clone() };

        let waker = crate::task::waker(main_task.clone());
        let mut cx = Context::from_waker(&waker);
        let mut main = pin!(main);

        let span = tracing::debug_span!("hub.driver");
        let _entered = span.enter();

        // the main task starts immediately; everything else waits for its
        // first suspension
        self.main_woken.set(true);

        loop {
            if let Some(err) = self.crash.borrow_mut().take() {
                return Err(err);
            }

            if self.main_woken.replace(false) {
                let poll = {
                    let _task = enter_task(main_task.clone());
                    main.as_mut().poll(&mut cx)
                };
                if let Poll::Ready(result) = poll {
                    return result;
                }
            }

            match self.reactor.dispatch() {
                Ok(Dispatch::Dispatched) => {}
                Ok(Dispatch::Exhausted) => {
                    tracing::debug!("driver finished: no events registered");
                    return Err(Exhausted(()).into());
                }
                Ok(Dispatch::Stopped) => {
                    tracing::debug!("driver finished: stop requested");
                    return Err(Stopped(()).into());
                }
                Err(err) => {
                    tracing::debug!(%err, "driver finished: reactor error");
                    return Err(err.into());
                }
            }
        }
    }

    /// Create a task running `future` and arm a zero-delay timer that first
    /// polls it. Never yields; the new task does not run until the calling
    /// task next switches out.
    pub fn spawn<F>(self: &Rc<Self>, future: F) -> TaskHandle
    where
        F: Future<Output = Result<()>> + 'static,
    {
        self.spawn_at(Duration::ZERO, future)
    }

    /// Like [`Hub::spawn`], with the first poll delayed by `delay`.
    pub fn spawn_later<F>(self: &Rc<Self>, delay: Duration, future: F) -> TaskHandle
    where
        F: Future<Output = Result<()>> + 'static,
    {
        self.spawn_at(delay, future)
    }

    fn spawn_at<F>(self: &Rc<Self>, delay: Duration, future: F) -> TaskHandle
    where
        F: Future<Output = Result<()>> + 'static,
    {
        let task = TaskState::new_spawned(Rc::downgrade(self), Box::pin(future));
        tracing::trace!(task = %task.id(), ?delay, "spawning");
        let target = task.clone();
        self.reactor
            .timer(delay, Box::new(move |_event, _flags| target.poll()));
        TaskHandle { state: task }
    }

    /// Fork the process and re-arm the reactor's kernel state on both sides.
    ///
    /// Armed registrations survive as objects; the child gets a fresh
    /// demultiplexer underneath them.
    ///
    /// # Errors
    ///
    /// Propagates `fork(2)` and reactor reinitialization failures.
    #[cfg(unix)]
    pub fn fork(&self) -> io::Result<ForkResult> {
        // Safety: no locks are held here; the runtime is single-threaded, so
        // the child resumes in a consistent state.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        self.reactor.reinit()?;
        if pid == 0 {
            Ok(ForkResult::Child)
        } else {
            Ok(ForkResult::Parent(pid))
        }
    }

    #[cfg(unix)]
    fn install_sigint(self: &Rc<Self>) {
        if self.sigint.borrow().is_some() {
            return;
        }
        let hub = Rc::downgrade(self);
        let cb: SignalCallback = Box::new(move |_flags| {
            let Some(hub) = hub.upgrade() else { return };
            let main = hub.main.borrow().clone();
            match main {
                Some(main) => main.throw(Interrupt(()).into()),
                None => tracing::warn!("interrupt with no main task to deliver to"),
            }
        });
        match self.reactor.signal(libc::SIGINT, cb) {
            Ok(event) => *self.sigint.borrow_mut() = Some(event),
            Err(err) => tracing::warn!(%err, "could not install the interrupt handler"),
        }
    }

    #[cfg(not(unix))]
    fn install_sigint(self: &Rc<Self>) {}

    pub(crate) fn set_main_woken(&self) {
        self.main_woken.set(true);
    }

    pub(crate) fn main_task(&self) -> Option<Rc<TaskState>> {
        self.main.borrow().clone()
    }

    pub(crate) fn record_crash(&self, err: Error) {
        let mut crash = self.crash.borrow_mut();
        match &*crash {
            None => *crash = Some(err),
            Some(first) => {
                tracing::error!(%err, %first, "second uncaught failure dropped");
            }
        }
    }
}

/// Outcome of [`Hub::fork`].
#[cfg(unix)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ForkResult {
    Parent(libc::pid_t),
    Child,
}

struct HubGuard;

impl HubGuard {
    fn enter(hub: Rc<Hub>) -> Self {
        hub.running.set(true);
        CURRENT_HUB.with(|slot| *slot.borrow_mut() = Some(hub));
        Self
    }
}

impl Drop for HubGuard {
    fn drop(&mut self) {
        CURRENT_HUB.with(|slot| {
            if let Some(hub) = slot.borrow_mut().take() {
                hub.running.set(false);
            }
        });
    }
}

struct MainGuard {
    hub: Rc<Hub>,
}

impl Drop for MainGuard {
    fn drop(&mut self) {
        if let Some(main) = self.hub.main.borrow_mut().take() {
            main.kill_switch();
        }
        self.hub.main_woken.set(false);
    }
}

pub(crate) struct TaskGuard {
    previous: Option<Rc<TaskState>>,
}

/// Mark `task` as the currently executing task for the duration of a poll.
pub(crate) fn enter_task(task: Rc<TaskState>) -> TaskGuard {
    let previous = CURRENT_TASK.with(|slot| slot.borrow_mut().replace(task));
    TaskGuard { previous }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|slot| *slot.borrow_mut() = self.previous.take());
    }
}

/// The task currently being polled, `None` in the driver context.
pub(crate) fn current_task() -> Option<Rc<TaskState>> {
    CURRENT_TASK.with(|slot| slot.borrow().clone())
}

/// Spawn `future` onto the current hub.
///
/// # Panics
///
/// Panics when no driver loop is running on this thread.
pub fn spawn<F>(future: F) -> TaskHandle
where
    F: Future<Output = Result<()>> + 'static,
{
    Hub::current()
        .expect("no hub is running on this thread")
        .spawn(future)
}

/// Spawn `future` onto the current hub with its first poll delayed.
///
/// # Panics
///
/// Panics when no driver loop is running on this thread.
pub fn spawn_later<F>(delay: Duration, future: F) -> TaskHandle
where
    F: Future<Output = Result<()>> + 'static,
{
    Hub::current()
        .expect("no hub is running on this thread")
        .spawn_later(delay, future)
}

/// Kill `task` with the [`Killed`] sentinel; the driver treats the death as
/// a normal cancellation.
///
/// # Errors
///
/// Propagates a failure injected into the caller while it yields.
///
/// # Panics
///
/// Panics when no driver loop is running on this thread.
pub async fn kill(task: &TaskHandle) -> Result<()> {
    kill_with(task, Killed(()).into()).await
}

/// Throw `exc` into `task` through a zero-delay timer. When called from a
/// user task, yields once so the kill is delivered promptly.
///
/// # Errors
///
/// Propagates a failure injected into the caller while it yields.
///
/// # Panics
///
/// Panics when no driver loop is running on this thread.
pub async fn kill_with(task: &TaskHandle, exc: Error) -> Result<()> {
    let hub = Hub::current().expect("no hub is running on this thread");
    let target = task.state.clone();
    hub.reactor().timer(
        Duration::ZERO,
        Box::new(move |_event, _flags| target.throw(exc)),
    );
    if current_task().is_some() {
        crate::wait::sleep(Duration::ZERO).await?;
    }
    Ok(())
}
