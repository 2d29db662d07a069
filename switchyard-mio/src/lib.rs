// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! mio-backed reactor for the switchyard runtime.
//!
//! [`MioReactor`] implements the core reactor interface over `mio`'s
//! epoll/kqueue poller. Oneshot fd waits are grouped into per-fd sources
//! with one waiter list per direction; the fd's registered interest is the
//! union of what the lists need and is re-synced as waiters come and go.
//! Timers and I/O deadlines are ordered `BTreeMap`s keyed by instant and
//! arming sequence. Signal delivery rides a dedicated token through
//! `signal-hook-mio`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use switchyard::Hub;
use switchyard::reactor::{Callback, Dispatch, EventFlags, EventRef, Reactor, SignalCallback};

mod signals;

use signals::SignalState;

/// Token reserved for the signal stream; slab keys never reach it.
const SIGNAL_TOKEN: Token = Token(usize::MAX);

pub struct MioReactor {
    weak: Weak<MioReactor>,
    stop: Cell<bool>,
    state: RefCell<State>,
}

struct State {
    poll: Poll,
    events: Events,
    /// mio token -> fd of the source it was issued for.
    tokens: Slab<RawFd>,
    sources: HashMap<RawFd, Source>,
    io: HashMap<u64, IoWait>,
    timers: BTreeMap<(Instant, u64), TimerWait>,
    seq: u64,
    signals: Option<SignalState>,
}

/// One registered fd: its token and the armed waits per direction. A
/// readwrite wait appears in both lists under the same id.
struct Source {
    token: usize,
    read: Vec<u64>,
    write: Vec<u64>,
}

struct IoWait {
    event: EventRef,
    fd: RawFd,
    interest: EventFlags,
    deadline: Option<Instant>,
    cb: Callback,
}

struct TimerWait {
    event: EventRef,
    cb: Callback,
}

// === impl MioReactor ===

impl MioReactor {
    /// Create a reactor over a fresh poller.
    ///
    /// # Errors
    ///
    /// Propagates poller creation failures.
    pub fn new() -> io::Result<Rc<MioReactor>> {
        let poll = Poll::new()?;
        tracing::debug!("mio reactor initialized");
        Ok(Rc::new_cyclic(|weak| MioReactor {
            weak: weak.clone(),
            stop: Cell::new(false),
            state: RefCell::new(State {
                poll,
                events: Events::with_capacity(1024),
                tokens: Slab::new(),
                sources: HashMap::new(),
                io: HashMap::new(),
                timers: BTreeMap::new(),
                seq: 0,
                signals: None,
            }),
        }))
    }

    fn arm_io(
        &self,
        fd: RawFd,
        want: EventFlags,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> io::Result<EventRef> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;

        state.seq += 1;
        let id = state.seq;

        if let Some(source) = state.sources.get_mut(&fd) {
            if want.contains(EventFlags::READ) {
                source.read.push(id);
            }
            if want.contains(EventFlags::WRITE) {
                source.write.push(id);
            }
            let interest = interest_of(source).expect("source just gained a waiter");
            if let Err(err) =
                state
                    .poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(source.token), interest)
            {
                source.read.retain(|&w| w != id);
                source.write.retain(|&w| w != id);
                return Err(err);
            }
        } else {
            let token = state.tokens.insert(fd);
            let mut source = Source {
                token,
                read: Vec::new(),
                write: Vec::new(),
            };
            if want.contains(EventFlags::READ) {
                source.read.push(id);
            }
            if want.contains(EventFlags::WRITE) {
                source.write.push(id);
            }
            let interest = interest_of(&source).expect("source just gained a waiter");
            if let Err(err) = state
                .poll
                .registry()
                .register(&mut SourceFd(&fd), Token(token), interest)
            {
                state.tokens.remove(token);
                return Err(err);
            }
            state.sources.insert(fd, source);
        }

        let weak = self.weak.clone();
        let event = EventRef::new(Box::new(move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.cancel_io(id);
            }
        }));
        tracing::trace!(event = event.id(), fd, ?want, ?timeout, "io wait armed");
        state.io.insert(
            id,
            IoWait {
                event: event.clone(),
                fd,
                interest: want,
                deadline: timeout.map(|t| Instant::now() + t),
                cb,
            },
        );
        Ok(event)
    }

    fn cancel_io(&self, id: u64) {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let Some(wait) = state.io.remove(&id) else {
            return;
        };
        if let Err(err) = detach(state, wait.fd, id) {
            tracing::warn!(fd = wait.fd, %err, "deregistering a cancelled wait failed");
        }
    }

    fn run_signal(&self, signum: i32) {
        let entry = {
            let mut state = self.state.borrow_mut();
            state
                .signals
                .as_mut()
                .and_then(|signals| signals.take_handler(signum))
        };
        let Some(mut entry) = entry else {
            tracing::trace!(signum, "signal with no registered handler");
            return;
        };
        if !entry.event.is_cancelled() {
            (entry.cb)(EventFlags::SIGNAL);
        }
        if !entry.event.is_cancelled() {
            let mut state = self.state.borrow_mut();
            if let Some(signals) = state.signals.as_mut() {
                signals.put_handler(signum, entry);
            }
        }
    }
}

impl Reactor for MioReactor {
    fn timer(&self, delay: Duration, cb: Callback) -> EventRef {
        let mut state = self.state.borrow_mut();
        state.seq += 1;
        let key = (Instant::now() + delay, state.seq);
        let weak = self.weak.clone();
        let event = EventRef::new(Box::new(move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.state.borrow_mut().timers.remove(&key);
            }
        }));
        tracing::trace!(event = event.id(), ?delay, "timer armed");
        state.timers.insert(
            key,
            TimerWait {
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
        self.arm_io(fd, EventFlags::READ, timeout, cb)
    }

    fn write_event(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> io::Result<EventRef> {
        self.arm_io(fd, EventFlags::WRITE, timeout, cb)
    }

    fn readwrite_event(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        cb: Callback,
    ) -> io::Result<EventRef> {
        self.arm_io(fd, EventFlags::READ | EventFlags::WRITE, timeout, cb)
    }

    fn signal(&self, signum: i32, cb: SignalCallback) -> io::Result<EventRef> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        if state.signals.is_none() {
            state.signals = Some(SignalState::new(
                signum,
                state.poll.registry(),
                SIGNAL_TOKEN,
            )?);
        }
        let signals = state.signals.as_mut().expect("signal state just created");
        signals.watch(signum)?;

        let weak = self.weak.clone();
        let event = EventRef::new(Box::new(move || {
            if let Some(reactor) = weak.upgrade() {
                if let Some(signals) = reactor.state.borrow_mut().signals.as_mut() {
                    signals.take_handler(signum);
                }
            }
        }));
        signals.set_handler(signum, event.clone(), cb);
        tracing::trace!(event = event.id(), signum, "signal handler registered");
        Ok(event)
    }

    fn dispatch(&self) -> io::Result<Dispatch> {
        if self.stop.take() {
            return Ok(Dispatch::Stopped);
        }

        let mut fired: Vec<(Callback, EventRef, EventFlags)> = Vec::new();
        let mut signals_fired: Vec<i32> = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;

            if state.io.is_empty() && state.timers.is_empty() {
                return Ok(Dispatch::Exhausted);
            }

            let now = Instant::now();
            let next_timer = state.timers.keys().next().map(|&(at, _)| at);
            let next_io = state.io.values().filter_map(|w| w.deadline).min();
            let timeout = [next_timer, next_io]
                .into_iter()
                .flatten()
                .min()
                .map(|at| at.saturating_duration_since(now));

            match state.poll.poll(&mut state.events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }

            let hits: Vec<(Token, bool, bool)> = state
                .events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();

            for (token, readable, writable) in hits {
                if token == SIGNAL_TOKEN {
                    if let Some(signals) = state.signals.as_mut() {
                        signals_fired.extend(signals.pending());
                    }
                    continue;
                }
                let Some(&fd) = state.tokens.get(token.0) else {
                    // stale event for a token freed earlier in this round
                    continue;
                };
                let mut flags = EventFlags::empty();
                if readable {
                    flags |= EventFlags::READ;
                }
                if writable {
                    flags |= EventFlags::WRITE;
                }

                let ids: Vec<u64> = {
                    let Some(source) = state.sources.get(&fd) else {
                        continue;
                    };
                    let mut ids = Vec::new();
                    if readable {
                        ids.extend(source.read.iter().copied());
                    }
                    if writable {
                        for &id in &source.write {
                            if !ids.contains(&id) {
                                ids.push(id);
                            }
                        }
                    }
                    ids
                };
                for id in ids {
                    let Some(wait) = state.io.remove(&id) else {
                        continue;
                    };
                    if let Err(err) = detach(state, fd, id) {
                        tracing::warn!(fd, %err, "re-syncing fd interest failed");
                    }
                    if wait.event.disarm() {
                        fired.push((wait.cb, wait.event, flags & wait.interest));
                    }
                }
            }

            let now = Instant::now();
            while let Some((&key, _)) = state.timers.first_key_value() {
                if key.0 > now {
                    break;
                }
                let timer = state.timers.remove(&key).expect("due timer disappeared");
                if timer.event.disarm() {
                    fired.push((timer.cb, timer.event, EventFlags::TIMEOUT));
                }
            }

            let overdue: Vec<u64> = state
                .io
                .iter()
                .filter(|(_, w)| w.deadline.is_some_and(|at| at <= now))
                .map(|(&id, _)| id)
                .collect();
            for id in overdue {
                let wait = state.io.remove(&id).expect("overdue wait disappeared");
                if let Err(err) = detach(state, wait.fd, id) {
                    tracing::warn!(fd = wait.fd, %err, "re-syncing fd interest failed");
                }
                if wait.event.disarm() {
                    fired.push((wait.cb, wait.event, EventFlags::TIMEOUT));
                }
            }
        }

        for signum in signals_fired {
            self.run_signal(signum);
        }
        for (cb, event, flags) in fired {
            if event.is_cancelled() {
                continue;
            }
            tracing::trace!(event = event.id(), ?flags, "event fired");
            cb(&event, flags);
        }
        Ok(Dispatch::Dispatched)
    }

    fn stop(&self) {
        self.stop.set(true);
    }

    fn reinit(&self) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;

        let poll = Poll::new()?;
        for (fd, source) in &state.sources {
            if let Some(interest) = interest_of(source) {
                poll.registry()
                    .register(&mut SourceFd(fd), Token(source.token), interest)?;
            }
        }
        if let Some(signals) = state.signals.as_mut() {
            signals.migrate(state.poll.registry(), poll.registry(), SIGNAL_TOKEN)?;
        }
        state.poll = poll;
        tracing::debug!("reactor kernel state re-armed");
        Ok(())
    }

    fn pending(&self) -> usize {
        let state = self.state.borrow();
        state.io.len() + state.timers.len()
    }
}

fn interest_of(source: &Source) -> Option<Interest> {
    match (!source.read.is_empty(), !source.write.is_empty()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Drop waiter `id` from `fd`'s source and re-sync the registered interest,
/// deregistering the fd entirely once no waiter needs it.
fn detach(state: &mut State, fd: RawFd, id: u64) -> io::Result<()> {
    let State {
        poll,
        tokens,
        sources,
        ..
    } = state;
    let Some(source) = sources.get_mut(&fd) else {
        return Ok(());
    };
    source.read.retain(|&w| w != id);
    source.write.retain(|&w| w != id);
    match interest_of(source) {
        Some(interest) => {
            poll.registry()
                .reregister(&mut SourceFd(&fd), Token(source.token), interest)
        }
        None => {
            let token = source.token;
            sources.remove(&fd);
            tokens.remove(token);
            poll.registry().deregister(&mut SourceFd(&fd))
        }
    }
}

thread_local! {
    static HUB: RefCell<Option<Rc<Hub>>> = const { RefCell::new(None) };
}

/// The thread's hub over a lazily created [`MioReactor`].
///
/// # Errors
///
/// Propagates reactor creation failures on first use.
pub fn hub() -> io::Result<Rc<Hub>> {
    HUB.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(hub) = &*slot {
            return Ok(hub.clone());
        }
        let hub = Hub::new(MioReactor::new()?);
        *slot = Some(hub.clone());
        Ok(hub)
    })
}

/// Drive `main` on the thread's hub until it completes.
///
/// # Errors
///
/// Whatever `main` resolves to, plus the driver exits of
/// [`Hub::block_on`].
pub fn run<F, T>(main: F) -> switchyard::Result<T>
where
    F: Future<Output = switchyard::Result<T>>,
{
    hub()?.block_on(main)
}
