// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Routing OS signals into the runtime.
//!
//! Handlers run in the driver context, one invocation per delivery. A
//! failure returned by a handler is thrown into the main task, so a signal
//! can unblock `block_on` the same way Ctrl-C does through the hub's
//! default SIGINT registration.

use std::rc::Rc;

use crate::Result;
use crate::hub::Hub;
use crate::reactor::EventRef;

/// Register `handler` for `signum` on the current hub.
///
/// The registration is persistent until the returned event is cancelled.
///
/// # Errors
///
/// Fails when the reactor cannot watch the signal.
///
/// # Panics
///
/// Panics when no driver loop is running on this thread.
pub fn signal<F>(signum: i32, handler: F) -> Result<EventRef>
where
    F: FnMut() -> Result<()> + 'static,
{
    let hub = Hub::current().expect("no hub is running on this thread");
    hub_signal(&hub, signum, handler)
}

/// Register `handler` for `signum` on `hub`. See [`signal`].
///
/// # Errors
///
/// Fails when the reactor cannot watch the signal.
pub fn hub_signal<F>(hub: &Rc<Hub>, signum: i32, mut handler: F) -> Result<EventRef>
where
    F: FnMut() -> Result<()> + 'static,
{
    let weak = Rc::downgrade(hub);
    let event = hub.reactor().signal(
        signum,
        Box::new(move |_flags| {
            let Err(err) = handler() else { return };
            let main = weak.upgrade().and_then(|hub| hub.main_task());
            match main {
                Some(main) => main.throw(err),
                None => tracing::error!(signum, %err, "signal handler failure with no main task"),
            }
        }),
    )?;
    Ok(event)
}
