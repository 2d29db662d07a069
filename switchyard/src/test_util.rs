// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A deterministic reactor over a virtual clock for in-crate tests.
//!
//! Time never passes on its own: when no injected readiness and no due
//! deadline exists, `dispatch` jumps the clock to the next deadline. Tests
//! mark fds ready with [`TestReactor::set_ready`] and deliver signals with
//! [`TestReactor::raise`].

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::reactor::{Callback, Dispatch, EventFlags, EventRef, Reactor, SignalCallback};

pub(crate) struct TestReactor {
    weak: Weak<TestReactor>,
    now: Cell<Duration>,
    seq: Cell<u64>,
    stop: Cell<bool>,
    cancelled: Cell<usize>,
    inner: RefCell<Inner>,
}

#[derive(Default)]
struct Inner {
    timers: BTreeMap<(Duration, u64), Armed>,
    io: BTreeMap<u64, IoWait>,
    ready: Vec<(RawFd, EventFlags)>,
    signals: HashMap<i32, SignalEntry>,
}

struct Armed {
    event: EventRef,
    cb: Callback,
}

struct IoWait {
    event: EventRef,
    fd: RawFd,
    interest: EventFlags,
    deadline: Option<Duration>,
    cb: Callback,
}

struct SignalEntry {
    event: EventRef,
    cb: SignalCallback,
}

impl TestReactor {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            now: Cell::new(Duration::ZERO),
            seq: Cell::new(0),
            stop: Cell::new(false),
            cancelled: Cell::new(0),
            inner: RefCell::new(Inner::default()),
        })
    }

    pub(crate) fn now(&self) -> Duration {
        self.now.get()
    }

    /// How many armed events were cancelled while still registered.
    pub(crate) fn cancelled(&self) -> usize {
        self.cancelled.get()
    }

    /// Mark `fd` ready; the next dispatch round fires matching waits
    /// without advancing the clock.
    pub(crate) fn set_ready(&self, fd: RawFd, flags: EventFlags) {
        self.inner.borrow_mut().ready.push((fd, flags));
    }

    /// Deliver a signal to its registered handler, driver-context style.
    pub(crate) fn raise(&self, signum: i32) {
        let entry = self.inner.borrow_mut().signals.remove(&signum);
        let Some(mut entry) = entry else { return };
        if !entry.event.is_cancelled() {
            (entry.cb)(EventFlags::SIGNAL);
        }
        if !entry.event.is_cancelled() {
            self.inner.borrow_mut().signals.entry(signum).or_insert(entry);
        }
    }

    fn next_seq(&self) -> u64 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        seq
    }

    fn arm_io(
        &self,
        fd: RawFd,
        interest: EventFlags,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> EventRef {
        let id = self.next_seq();
        let weak = self.weak.clone();
        let event = EventRef::new(Box::new(move || {
            if let Some(reactor) = weak.upgrade() {
                if reactor.inner.borrow_mut().io.remove(&id).is_some() {
                    reactor.cancelled.set(reactor.cancelled.get() + 1);
                }
            }
        }));
        self.inner.borrow_mut().io.insert(
            id,
            IoWait {
                event: event.clone(),
                fd,
                interest,
                deadline: timeout.map(|t| self.now.get() + t),
                cb,
            },
        );
        event
    }
}

impl Reactor for TestReactor {
    fn timer(&self, delay: Duration, cb: Callback) -> EventRef {
        let key = (self.now.get() + delay, self.next_seq());
        let weak = self.weak.clone();
        let event = EventRef::new(Box::new(move || {
            if let Some(reactor) = weak.upgrade() {
                if reactor.inner.borrow_mut().timers.remove(&key).is_some() {
                    reactor.cancelled.set(reactor.cancelled.get() + 1);
                }
            }
        }));
        self.inner.borrow_mut().timers.insert(
            key,
            Armed {
                event: event.clone(),
                cb,
            },
        );
        event
    }

    fn read_event(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> io::Result<EventRef> {
        Ok(self.arm_io(fd, EventFlags::READ, timeout, cb))
    }

    fn write_event(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> io::Result<EventRef> {
        Ok(self.arm_io(fd, EventFlags::WRITE, timeout, cb))
    }

    fn readwrite_event(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> io::Result<EventRef> {
        Ok(self.arm_io(fd, EventFlags::READ | EventFlags::WRITE, timeout, cb))
    }

    fn signal(&self, signum: i32, cb: SignalCallback) -> io::Result<EventRef> {
        let weak = self.weak.clone();
        let event = EventRef::new(Box::new(move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.inner.borrow_mut().signals.remove(&signum);
            }
        }));
        self.inner.borrow_mut().signals.insert(
            signum,
            SignalEntry {
                event: event.clone(),
                cb,
            },
        );
        Ok(event)
    }

    fn dispatch(&self) -> io::Result<Dispatch> {
        if self.stop.take() {
            return Ok(Dispatch::Stopped);
        }

        let mut fired: Vec<(Callback, EventRef, EventFlags)> = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.timers.is_empty() && inner.io.is_empty() {
                return Ok(Dispatch::Exhausted);
            }

            let ready = mem::take(&mut inner.ready);
            for (fd, flags) in ready {
                let ids: Vec<u64> = inner
                    .io
                    .iter()
                    .filter(|(_, w)| w.fd == fd && w.interest.intersects(flags))
                    .map(|(&id, _)| id)
                    .collect();
                for id in ids {
                    let wait = inner.io.remove(&id).expect("io wait disappeared");
                    if wait.event.disarm() {
                        let observed = flags & wait.interest;
                        fired.push((wait.cb, wait.event, observed));
                    }
                }
            }

            if fired.is_empty() {
                let next_timer = inner.timers.keys().next().map(|&(at, _)| at);
                let next_io = inner.io.values().filter_map(|w| w.deadline).min();
                let next = [next_timer, next_io].into_iter().flatten().min();
                let Some(next) = next else {
                    panic!("virtual reactor stalled: waiters without deadlines and no readiness injected");
                };
                if next > self.now.get() {
                    self.now.set(next);
                }
                let now = self.now.get();

                while let Some((&(at, seq), _)) = inner.timers.first_key_value() {
                    if at > now {
                        break;
                    }
                    let armed = inner.timers.remove(&(at, seq)).expect("timer disappeared");
                    if armed.event.disarm() {
                        fired.push((armed.cb, armed.event, EventFlags::TIMEOUT));
                    }
                }

                let due: Vec<u64> = inner
                    .io
                    .iter()
                    .filter(|(_, w)| w.deadline.is_some_and(|d| d <= now))
                    .map(|(&id, _)| id)
                    .collect();
                for id in due {
                    let wait = inner.io.remove(&id).expect("io wait disappeared");
                    if wait.event.disarm() {
                        fired.push((wait.cb, wait.event, EventFlags::TIMEOUT));
                    }
                }
            }
        }

        for (cb, event, flags) in fired {
            if event.is_cancelled() {
                continue;
            }
            cb(&event, flags);
        }
        Ok(Dispatch::Dispatched)
    }

    fn stop(&self) {
        self.stop.set(true);
    }

    fn reinit(&self) -> io::Result<()> {
        self.inner.borrow_mut().ready.clear();
        Ok(())
    }

    fn pending(&self) -> usize {
        let inner = self.inner.borrow();
        inner.timers.len() + inner.io.len()
    }
}
