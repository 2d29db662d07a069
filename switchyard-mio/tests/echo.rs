// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A TCP echo server and client sharing one hub.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use switchyard::socket::{self, Domain, Protocol, SockAddr, Socket, Type};
use switchyard::{Hub, spawn};
use switchyard_mio::MioReactor;

fn new_hub() -> Rc<Hub> {
    Hub::new(MioReactor::new().expect("reactor"))
}

#[test]
fn echo_roundtrip() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let hub = new_hub();
    hub.block_on(async {
        let listener = socket::tcp_listener("127.0.0.1:0".parse::<SocketAddr>()?, 50)?;
        let addr = listener.getsockname()?.as_socket().expect("inet listener");

        spawn(async move {
            let (conn, _peer) = listener.accept().await?;
            let data = conn.recv(1024).await?;
            conn.sendall(&data).await?;
            conn.close();
            listener.close();
            Ok(())
        });

        let client = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        client.connect(&SockAddr::from(addr)).await?;
        client.sendall(b"ping\n").await?;
        let echoed = client.recv(1024).await?;
        assert_eq!(&echoed[..], b"ping\n");
        client.close();
        Ok(())
    })
    .unwrap();
}

#[test]
fn create_connection_and_line_oriented_io() {
    let hub = new_hub();
    hub.block_on(async {
        let listener = socket::tcp_listener("127.0.0.1:0".parse::<SocketAddr>()?, 50)?;
        let addr = listener.getsockname()?.as_socket().expect("inet listener");

        spawn(async move {
            let (conn, _peer) = listener.accept().await?;
            let mut file = conn.makefile()?;
            let line = file.read_line().await?;
            file.write_all(&line).await?;
            Ok(())
        });

        let client =
            socket::create_connection("127.0.0.1", addr.port(), Some(Duration::from_secs(5)))
                .await?;
        client.sendall(b"hello switchyard\n").await?;
        let mut file = client.makefile()?;
        let line = file.read_line().await?;
        assert_eq!(&line[..], b"hello switchyard\n");
        Ok(())
    })
    .unwrap();
}

#[test]
fn dup_shares_the_underlying_stream() {
    let hub = new_hub();
    hub.block_on(async {
        let (a, b) = socket::socketpair(Domain::UNIX, Type::STREAM, None)?;
        let a2 = a.dup()?;
        a.close();

        // the duplicate stays usable after the original wrapper closed
        a2.sendall(b"via dup").await?;
        let got = b.recv(16).await?;
        assert_eq!(&got[..], b"via dup");
        Ok(())
    })
    .unwrap();
}
