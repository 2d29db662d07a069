// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Signal events over `signal-hook-mio`.
//!
//! All watched signals share one mio source registered at the reserved
//! signal token; delivery is a readable event on that token, and the
//! pending signal numbers are drained from the stream. Cancelling a signal
//! event drops its handler; the underlying watch stays installed, which
//! keeps cancellation cheap and idempotent.

use std::collections::HashMap;
use std::io;

use mio::{Interest, Registry, Token};
use signal_hook_mio::v1_0::Signals;

use switchyard::reactor::{EventRef, SignalCallback};

pub(crate) struct SignalState {
    signals: Signals,
    handlers: HashMap<i32, SignalEntry>,
}

pub(crate) struct SignalEntry {
    pub(crate) event: EventRef,
    pub(crate) cb: SignalCallback,
}

impl SignalState {
    pub(crate) fn new(signum: i32, registry: &Registry, token: Token) -> io::Result<Self> {
        let mut signals = Signals::new([signum])?;
        registry.register(&mut signals, token, Interest::READABLE)?;
        Ok(Self {
            signals,
            handlers: HashMap::new(),
        })
    }

    /// Make sure `signum` is part of the watched set.
    pub(crate) fn watch(&self, signum: i32) -> io::Result<()> {
        self.signals.add_signal(signum)
    }

    pub(crate) fn set_handler(&mut self, signum: i32, event: EventRef, cb: SignalCallback) {
        self.handlers.insert(signum, SignalEntry { event, cb });
    }

    pub(crate) fn take_handler(&mut self, signum: i32) -> Option<SignalEntry> {
        self.handlers.remove(&signum)
    }

    pub(crate) fn put_handler(&mut self, signum: i32, entry: SignalEntry) {
        self.handlers.entry(signum).or_insert(entry);
    }

    /// Drain the signal numbers delivered since the last poll.
    pub(crate) fn pending(&mut self) -> Vec<i32> {
        self.signals.pending().collect()
    }

    /// Move the signal stream from `old` to `new` after the poller has been
    /// rebuilt. Deregistration failures are ignored; the old selector may
    /// already be gone.
    pub(crate) fn migrate(&mut self, old: &Registry, new: &Registry, token: Token) -> io::Result<()> {
        if let Err(err) = old.deregister(&mut self.signals) {
            tracing::debug!(%err, "deregistering the signal stream from the old poller failed");
        }
        new.register(&mut self.signals, token, Interest::READABLE)
    }
}
