// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fork reinitialization. Kept alone in this binary so no sibling test
//! thread is running when the process forks.

use std::time::Duration;

use switchyard::{ForkResult, Hub, sleep, spawn};
use switchyard_mio::MioReactor;

#[test]
fn child_dispatches_on_fresh_kernel_state() {
    let hub = Hub::new(MioReactor::new().expect("reactor"));

    // run a driver once so the reactor has lived through real dispatch
    hub.block_on(sleep(Duration::from_millis(1))).unwrap();

    match hub.fork().unwrap() {
        ForkResult::Child => {
            let ok = hub
                .block_on(async {
                    spawn(async { sleep(Duration::ZERO).await });
                    sleep(Duration::from_millis(5)).await
                })
                .is_ok();
            // Safety: plain process exit without running atexit handlers,
            // which belong to the parent's test harness.
            unsafe { libc::_exit(i32::from(!ok)) };
        }
        ForkResult::Parent(pid) => {
            // the parent's hub keeps dispatching on its re-armed poller
            hub.block_on(sleep(Duration::from_millis(5))).unwrap();

            let mut status = 0;
            // Safety: waiting on the child we just forked.
            let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
            assert_eq!(waited, pid);
            assert!(libc::WIFEXITED(status), "child did not exit cleanly");
            assert_eq!(libc::WEXITSTATUS(status), 0, "child hub failed");
        }
    }
}
