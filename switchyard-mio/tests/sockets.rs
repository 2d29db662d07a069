// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative socket semantics: timeouts, cancellation, closed sockets.

use core::fmt;
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use switchyard::reactor::Reactor as _;
use switchyard::socket::{self, Domain, Protocol, SockAddr, Socket, Type};
use switchyard::{Hub, TimeoutExpired, kill_with, sleep, spawn};
use switchyard_mio::MioReactor;

#[derive(Debug)]
struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted by test")
    }
}

impl core::error::Error for Interrupted {}

fn new_hub() -> Rc<Hub> {
    Hub::new(MioReactor::new().expect("reactor"))
}

#[test]
fn recv_times_out_and_leaves_no_registration() {
    let hub = new_hub();
    let reactor = hub.reactor().clone();

    hub.block_on(async {
        // the peer writes nothing
        let (a, _b) = socket::socketpair(Domain::UNIX, Type::STREAM, None)?;
        a.settimeout(Some(Duration::from_millis(50)));

        let begin = Instant::now();
        let err = a.recv(1).await.unwrap_err();
        assert!(err.is::<TimeoutExpired>(), "unexpected error: {err}");
        let elapsed = begin.elapsed();
        assert!(
            elapsed >= Duration::from_millis(40) && elapsed < Duration::from_secs(2),
            "timed out after {elapsed:?}",
        );
        Ok(())
    })
    .unwrap();

    assert_eq!(reactor.pending(), 0, "leaked reactor registrations");
}

#[test]
fn zero_timeout_never_waits() {
    new_hub()
        .block_on(async {
            let (a, _b) = socket::socketpair(Domain::UNIX, Type::STREAM, None)?;
            a.setblocking(false);
            let err = a.recv(1).await.unwrap_err();
            let err = err.downcast_ref::<io::Error>().expect("io error");
            assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
            Ok(())
        })
        .unwrap();
}

#[test]
fn kill_unblocks_recv() {
    let hub = new_hub();
    let reactor = hub.reactor().clone();
    let caught = Rc::new(Cell::new(false));

    hub.block_on(async {
        let (a, b) = socket::socketpair(Domain::UNIX, Type::STREAM, None)?;
        let flag = caught.clone();
        let handle = spawn(async move {
            match a.recv(1).await {
                Err(err) if err.is::<Interrupted>() => {
                    flag.set(true);
                    Ok(())
                }
                other => other.map(|_| ()),
            }
        });

        sleep(Duration::from_millis(10)).await?; // let it block in recv
        kill_with(&handle, Interrupted.into()).await?;
        assert!(!handle.is_alive());
        assert!(caught.get());
        drop(b);
        Ok(())
    })
    .unwrap();

    assert_eq!(reactor.pending(), 0, "leaked reactor registrations");
}

#[test]
fn closed_socket_raises_bad_file_descriptor() {
    new_hub()
        .block_on(async {
            let (a, _b) = socket::socketpair(Domain::UNIX, Type::STREAM, None)?;
            a.close();
            a.close(); // idempotent

            let err = a.recv(1).await.unwrap_err();
            let err = err.downcast_ref::<io::Error>().expect("io error");
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));

            let err = a.sendall(b"x").await.unwrap_err();
            let err = err.downcast_ref::<io::Error>().expect("io error");
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));

            assert!(a.fileno().is_err());
            Ok(())
        })
        .unwrap();
}

#[test]
fn sendall_enforces_a_wall_clock_deadline() {
    new_hub()
        .block_on(async {
            let (a, _b) = socket::socketpair(Domain::UNIX, Type::STREAM, None)?;
            a.settimeout(Some(Duration::from_millis(100)));

            // nobody reads; the kernel buffer fills and the deadline expires
            let payload = vec![0x55u8; 8 * 1024 * 1024];
            let err = a.sendall(&payload).await.unwrap_err();
            assert!(err.is::<TimeoutExpired>(), "unexpected error: {err}");
            Ok(())
        })
        .unwrap();
}

#[test]
fn sendall_completes_against_a_draining_peer() {
    new_hub()
        .block_on(async {
            let (a, b) = socket::socketpair(Domain::UNIX, Type::STREAM, None)?;
            let payload = vec![0xA5u8; 1024 * 1024];
            let expected = payload.len();

            spawn(async move {
                a.sendall(&payload).await?;
                a.close();
                Ok(())
            });

            let mut received = 0;
            loop {
                let chunk = b.recv(64 * 1024).await?;
                if chunk.is_empty() {
                    break;
                }
                received += chunk.len();
            }
            assert_eq!(received, expected);
            Ok(())
        })
        .unwrap();
}

#[test]
fn connect_ex_reports_the_os_error_code() {
    new_hub()
        .block_on(async {
            // grab a port nothing listens on
            let probe = socket::tcp_listener("127.0.0.1:0".parse::<SocketAddr>()?, 1)?;
            let addr = probe.getsockname()?.as_socket().expect("inet listener");
            probe.close();

            let client = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            let code = client.connect_ex(&SockAddr::from(addr)).await?;
            assert_eq!(code, libc::ECONNREFUSED);
            Ok(())
        })
        .unwrap();
}

#[test]
fn datagram_pair_roundtrip() {
    new_hub()
        .block_on(async {
            let (a, b) = socket::socketpair(Domain::UNIX, Type::DGRAM, None)?;
            b.sendall(b"dgram").await?;
            let (data, _addr) = a.recvfrom(64).await?;
            assert_eq!(&data[..], b"dgram");

            let mut buf = [0u8; 64];
            b.sendall(b"again").await?;
            let (n, _addr) = a.recvfrom_into(&mut buf).await?;
            assert_eq!(&buf[..n], b"again");
            Ok(())
        })
        .unwrap();
}

#[test]
fn getaddrinfo_resolves_ipv4_only_for_unspecified_family() {
    let infos = socket::getaddrinfo("localhost", 80, None, Some(Type::STREAM)).unwrap();
    assert!(!infos.is_empty());
    assert!(infos.iter().all(|info| info.family == Domain::IPV4));
    assert!(infos.iter().all(|info| info.addr.is_ipv4()));
}
