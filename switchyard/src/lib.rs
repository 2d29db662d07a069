// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative single-thread concurrency runtime.
//!
//! Many logically independent tasks share one OS thread and yield control
//! around I/O and timers. The [`Hub`] drives an external reactor; tasks
//! suspend through the wait primitives and the cooperative [`socket`]
//! layer, and are resumed by reactor callbacks with exactly one resumption
//! value each. A reactor backend is required to run anything; the default
//! one lives in the `switchyard-mio` crate.

mod error;
pub mod hub;
pub mod reactor;
pub mod signal;
pub mod socket;
pub mod task;
pub mod timeout;
pub mod wait;

#[cfg(test)]
mod test_util;

pub use error::{Exhausted, Interrupt, Killed, Stopped, TimeoutExpired};
#[cfg(unix)]
pub use hub::ForkResult;
pub use hub::{Hub, kill, kill_with, spawn, spawn_later};
pub use signal::{hub_signal, signal};
pub use task::{TaskHandle, TaskId};
pub use timeout::{Timeout, silenced, with_timeout, with_timeout_or};
pub use wait::{sleep, wait_read, wait_readwrite, wait_write};

/// The dynamically typed failure value thrown into and out of tasks.
pub type Error = anyhow::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;
