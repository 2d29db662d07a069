// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scoped deadline injection.
//!
//! A [`Timeout`] arms a timer that throws an error into the task that
//! created it; leaving the scope (normally or by unwinding an error out of
//! it) cancels the timer. Scopes nest lexically. [`with_timeout_or`] tells
//! its own expiry apart from an unrelated outer scope's by the marker's
//! unique token, never by type.

use std::time::Duration;

use crate::error::{Silenced, TimeoutExpired};
use crate::hub::{Hub, current_task};
use crate::reactor::EventRef;
use crate::{Error, Result};

const NO_HUB: &str = "no hub is running on this thread";
const NOT_IN_TASK: &str = "timeout scopes may only be armed from a task";

/// A stack-scoped timer that throws into the task that armed it.
///
/// Cancellation on scope exit is guaranteed on all paths: `cancel` is
/// idempotent and `Drop` calls it.
pub struct Timeout {
    event: Option<EventRef>,
    silent_token: Option<u64>,
}

// === impl Timeout ===

impl Timeout {
    /// Arm a scope that throws `exc` into the current task after `seconds`.
    /// An absent deadline yields an inert scope: no timer, no cancellation
    /// effect.
    ///
    /// # Panics
    ///
    /// Panics when armed with a deadline outside a task.
    pub fn start(seconds: Option<Duration>, exc: Error) -> Timeout {
        let Some(seconds) = seconds else {
            return Timeout {
                event: None,
                silent_token: None,
            };
        };
        let hub = Hub::current().expect(NO_HUB);
        let task = current_task().expect(NOT_IN_TASK);
        let event = hub
            .reactor()
            .timer(seconds, Box::new(move |_event, _flags| task.throw(exc)));
        Timeout {
            event: Some(event),
            silent_token: None,
        }
    }

    /// Arm a scope that interrupts the current task silently: the thrown
    /// sentinel is meant to be swallowed with [`Timeout::silenced_by`] at
    /// this scope's boundary and nowhere else.
    ///
    /// # Panics
    ///
    /// Panics when armed with a deadline outside a task.
    pub fn start_silent(seconds: Option<Duration>) -> Timeout {
        let Some(seconds) = seconds else {
            return Timeout {
                event: None,
                silent_token: None,
            };
        };
        let marker = Silenced::new();
        let token = marker.token();
        let mut scope = Timeout::start(Some(seconds), marker.into());
        scope.silent_token = Some(token);
        scope
    }

    /// Whether `err` is this scope's own silent sentinel.
    pub fn silenced_by(&self, err: &Error) -> bool {
        match (self.silent_token, err.downcast_ref::<Silenced>()) {
            (Some(token), Some(marker)) => marker.token() == token,
            _ => false,
        }
    }

    /// Cancel the armed timer. Idempotent; inert scopes ignore it.
    pub fn cancel(&mut self) {
        if let Some(event) = self.event.take() {
            event.cancel();
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run `future` under a deadline.
///
/// On expiry the future's innermost wait returns this scope's
/// [`TimeoutExpired`] marker, which propagates to the caller. Errors from
/// unrelated scopes pass through untouched.
///
/// # Errors
///
/// The future's own error, or this scope's [`TimeoutExpired`] marker.
///
/// # Panics
///
/// Panics when called outside a task.
pub async fn with_timeout<F, T>(seconds: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let marker = TimeoutExpired::new();
    let mut scope = Timeout::start(Some(seconds), marker.into());
    let result = future.await;
    scope.cancel();
    result
}

/// Run `future` under a deadline, producing `fallback` on expiry.
///
/// Only the exact marker this call armed is converted to `fallback`
/// (identity by token); a timeout raised by a nested or enclosing scope
/// propagates.
///
/// # Errors
///
/// The future's own error; never this scope's expiry.
///
/// # Panics
///
/// Panics when called outside a task.
pub async fn with_timeout_or<F, T>(seconds: Duration, future: F, fallback: T) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let marker = TimeoutExpired::new();
    let token = marker.token();
    let mut scope = Timeout::start(Some(seconds), marker.into());
    let result = future.await;
    scope.cancel();
    match result {
        Err(err)
            if err
                .downcast_ref::<TimeoutExpired>()
                .is_some_and(|marker| marker.token() == token) =>
        {
            Ok(fallback)
        }
        other => other,
    }
}

/// Run `future` under a silent deadline: expiry interrupts the block and
/// yields `Ok(None)` instead of an error.
///
/// # Errors
///
/// The future's own error; the scope's sentinel is swallowed here.
///
/// # Panics
///
/// Panics when called with a deadline outside a task.
pub async fn silenced<F, T>(seconds: Option<Duration>, future: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    let mut scope = Timeout::start_silent(seconds);
    let result = future.await;
    scope.cancel();
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if scope.silenced_by(&err) => Ok(None),
        Err(err) => Err(err),
    }
}
