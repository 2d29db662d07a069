// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Raised when a deadline expires.
///
/// Every instance carries a unique token, so nested timeout scopes can tell
/// their own expiry apart from an unrelated outer one. [`crate::with_timeout_or`]
/// only swallows the exact marker it armed; everything else propagates.
#[derive(Debug)]
pub struct TimeoutExpired {
    token: u64,
}

impl TimeoutExpired {
    #[allow(clippy::new_without_default, reason = "each instance is a distinct marker")]
    pub fn new() -> Self {
        Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

impl fmt::Display for TimeoutExpired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("timed out")
    }
}

impl core::error::Error for TimeoutExpired {}

/// Sentinel thrown by silent timeout scopes; swallowed at the scope boundary
/// that armed it and never observed by callers of [`crate::silenced`].
#[derive(Debug)]
pub(crate) struct Silenced {
    token: u64,
}

impl Silenced {
    pub(crate) fn new() -> Self {
        Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

impl fmt::Display for Silenced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("silent timeout")
    }
}

impl core::error::Error for Silenced {}

/// Thrown into a task by [`crate::kill`]. The driver treats a task that died
/// with this error as cancelled, not crashed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Killed(pub(crate) ());

impl fmt::Display for Killed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("task killed")
    }
}

impl core::error::Error for Killed {}

/// Thrown into the main task when SIGINT fires, so Ctrl-C unblocks the
/// dispatch loop promptly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Interrupt(pub(crate) ());

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupt")
    }
}

impl core::error::Error for Interrupt {}

/// The dispatch loop ran out of registered events while the main task was
/// still suspended. The hub stays usable; the next `block_on` starts a fresh
/// driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Exhausted(pub(crate) ());

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dispatch finished: no events registered")
    }
}

impl core::error::Error for Exhausted {}

/// The dispatch loop was stopped by an external stop request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Stopped(pub(crate) ());

impl fmt::Display for Stopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dispatch stopped")
    }
}

impl core::error::Error for Stopped {}
