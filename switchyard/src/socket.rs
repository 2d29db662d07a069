// Copyright 2025 Switchyard Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative sockets.
//!
//! [`Socket`] mirrors the synchronous BSD socket surface but never blocks
//! the thread: the underlying socket is non-blocking for the wrapper's
//! entire lifetime and every would-block result suspends the calling task
//! on the matching wait primitive instead.
//!
//! The per-socket timeout follows the conventional tri-state: `None` waits
//! forever, a zero duration never waits (pure non-blocking), and a positive
//! duration is the wall-clock budget of each operation.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::io;
use std::mem::MaybeUninit;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use socket2::Socket as SysSocket;
pub use std::net::Shutdown;
pub use socket2::{Domain, Protocol, SockAddr, Type};

use crate::error::TimeoutExpired;
use crate::wait::{wait_read, wait_readwrite, wait_write};
use crate::{Error, Result};

enum SockState {
    Open(SysSocket),
    Closed,
}

pub struct Socket {
    sock: RefCell<SockState>,
    timeout: Cell<Option<Duration>>,
    family: Domain,
    kind: Type,
    protocol: Option<Protocol>,
}

// === impl Socket ===

impl Socket {
    /// Create a new cooperative socket. The underlying socket is put into
    /// non-blocking mode immediately and stays there.
    ///
    /// # Errors
    ///
    /// Propagates `socket(2)` and `fcntl(2)` failures.
    pub fn new(family: Domain, kind: Type, protocol: Option<Protocol>) -> io::Result<Socket> {
        Socket::from_sys(SysSocket::new(family, kind, protocol)?, family, kind, protocol)
    }

    /// Wrap an existing socket, forcing it into non-blocking mode.
    ///
    /// # Errors
    ///
    /// Propagates the `fcntl(2)` failure.
    pub fn from_sys(
        sock: SysSocket,
        family: Domain,
        kind: Type,
        protocol: Option<Protocol>,
    ) -> io::Result<Socket> {
        sock.set_nonblocking(true)?;
        Ok(Socket {
            sock: RefCell::new(SockState::Open(sock)),
            timeout: Cell::new(None),
            family,
            kind,
            protocol,
        })
    }

    pub fn family(&self) -> Domain {
        self.family
    }

    pub fn kind(&self) -> Type {
        self.kind
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// Accept a connection, suspending until one is pending.
    ///
    /// # Errors
    ///
    /// Would-block when the timeout is zero, [`TimeoutExpired`] on an
    /// exhausted budget, otherwise the OS error.
    pub async fn accept(&self) -> Result<(Socket, SockAddr)> {
        loop {
            match self.with_sock(|s| s.accept()) {
                Ok((sock, peer)) => {
                    let sock = Socket::from_sys(sock, self.family, self.kind, self.protocol)?;
                    return Ok((sock, peer));
                }
                Err(err) if would_block(&err) && !self.never_waits() => {}
                Err(err) => return Err(err.into()),
            }
            self.wait_readable().await?;
        }
    }

    /// Connect to `addr`, suspending until the connection is established.
    ///
    /// With a zero timeout this is a single direct non-blocking connect
    /// attempt whose result is returned as is. A finite timeout is measured
    /// against a fixed end instant across retries.
    ///
    /// # Errors
    ///
    /// The pending socket error (`SO_ERROR`) if one is set, the OS error of
    /// a failed attempt, or [`TimeoutExpired`] on an exhausted budget.
    pub async fn connect(&self, addr: &SockAddr) -> Result<()> {
        if self.never_waits() {
            return self.with_sock(|s| s.connect(addr)).map_err(Into::into);
        }

        let deadline = self.timeout.get().map(|t| Instant::now() + t);
        loop {
            if let Some(err) = self.with_sock(|s| s.take_error())? {
                return Err(err.into());
            }

            let errno = match self.with_sock(|s| s.connect(addr)) {
                Ok(()) => return Ok(()),
                Err(err) => match err.raw_os_error() {
                    Some(errno) => errno,
                    None => return Err(err.into()),
                },
            };
            if errno == libc::EISCONN {
                return Ok(());
            }
            if !connect_in_progress(errno) {
                return Err(io::Error::from_raw_os_error(errno).into());
            }

            let budget = match deadline {
                None => None,
                Some(end) => {
                    let left = end.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(TimeoutExpired::new().into());
                    }
                    Some(left)
                }
            };
            wait_readwrite(self.fileno()?, budget, TimeoutExpired::new().into()).await?;
        }
    }

    /// Like [`Socket::connect`], reporting OS-level outcomes as an errno:
    /// `0` on success, `EAGAIN` on timeout, otherwise the error's code.
    ///
    /// # Errors
    ///
    /// Failures that are not OS errors (injected errors, resolution
    /// failures) propagate instead of being folded into a code.
    pub async fn connect_ex(&self, addr: &SockAddr) -> Result<i32> {
        match self.connect(addr).await {
            Ok(()) => Ok(0),
            Err(err) if err.is::<TimeoutExpired>() => Ok(libc::EAGAIN),
            Err(err) => match err.downcast_ref::<io::Error>().and_then(io::Error::raw_os_error) {
                Some(errno) => Ok(errno),
                None => Err(err),
            },
        }
    }

    /// Receive up to `size` bytes.
    ///
    /// # Errors
    ///
    /// Would-block when the timeout is zero, [`TimeoutExpired`] on an
    /// exhausted budget, otherwise the OS error.
    pub async fn recv(&self, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let n = self.recv_into(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Receive into `buf`, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// As [`Socket::recv`].
    pub async fn recv_into(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.with_sock(|s| s.recv(as_uninit(buf))) {
                Ok(n) => return Ok(n),
                Err(err) if would_block(&err) && !self.never_waits() => {}
                Err(err) => return Err(err.into()),
            }
            self.wait_readable().await?;
        }
    }

    /// Receive up to `size` bytes and the sender's address.
    ///
    /// # Errors
    ///
    /// As [`Socket::recv`].
    pub async fn recvfrom(&self, size: usize) -> Result<(Vec<u8>, SockAddr)> {
        let mut buf = vec![0u8; size];
        let (n, addr) = self.recvfrom_into(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// Receive into `buf`, returning the byte count and sender's address.
    ///
    /// # Errors
    ///
    /// As [`Socket::recv`].
    pub async fn recvfrom_into(&self, buf: &mut [u8]) -> Result<(usize, SockAddr)> {
        loop {
            match self.with_sock(|s| s.recv_from(as_uninit(buf))) {
                Ok(result) => return Ok(result),
                Err(err) if would_block(&err) && !self.never_waits() => {}
                Err(err) => return Err(err.into()),
            }
            self.wait_readable().await?;
        }
    }

    /// Send once, waiting at most once for writability.
    ///
    /// A second would-block after the wait reports `0` bytes sent, so
    /// [`Socket::sendall`] can make progress on its next iteration.
    ///
    /// # Errors
    ///
    /// Would-block when the timeout is zero, [`TimeoutExpired`] on an
    /// exhausted budget, otherwise the OS error.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.send_within(buf, self.timeout.get()).await
    }

    /// [`Socket::send`] with an explicit per-call timeout overriding the
    /// per-socket one.
    ///
    /// # Errors
    ///
    /// As [`Socket::send`].
    pub async fn send_within(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        match self.with_sock(|s| s.send(buf)) {
            Ok(n) => Ok(n),
            Err(err) if would_block(&err) && timeout != Some(Duration::ZERO) => {
                wait_write(self.fileno()?, timeout, TimeoutExpired::new().into()).await?;
                match self.with_sock(|s| s.send(buf)) {
                    Ok(n) => Ok(n),
                    Err(err) if would_block(&err) => Ok(0),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Send the whole buffer, iterating [`Socket::send`]. A finite
    /// per-socket timeout is enforced as a wall-clock deadline across
    /// iterations.
    ///
    /// # Errors
    ///
    /// As [`Socket::send`]; [`TimeoutExpired`] when the deadline passes
    /// before the buffer is fully written.
    pub async fn sendall(&self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        match self.timeout.get() {
            None => {
                while sent < data.len() {
                    sent += self.send(&data[sent..]).await?;
                }
            }
            Some(timeout) => {
                let end = Instant::now() + timeout;
                let mut left = timeout;
                loop {
                    sent += self.send_within(&data[sent..], Some(left)).await?;
                    if sent >= data.len() {
                        break;
                    }
                    left = end.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(TimeoutExpired::new().into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Send a datagram to `addr`; same retry discipline as [`Socket::send`].
    ///
    /// # Errors
    ///
    /// As [`Socket::send`].
    pub async fn sendto(&self, buf: &[u8], addr: &SockAddr) -> Result<usize> {
        let timeout = self.timeout.get();
        match self.with_sock(|s| s.send_to(buf, addr)) {
            Ok(n) => Ok(n),
            Err(err) if would_block(&err) && timeout != Some(Duration::ZERO) => {
                wait_write(self.fileno()?, timeout, TimeoutExpired::new().into()).await?;
                match self.with_sock(|s| s.send_to(buf, addr)) {
                    Ok(n) => Ok(n),
                    Err(err) if would_block(&err) => Ok(0),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Close the socket. All later I/O fails with the OS "bad file
    /// descriptor" error. Idempotent.
    pub fn close(&self) {
        let mut slot = self.sock.borrow_mut();
        if let SockState::Open(sock) = &*slot {
            tracing::trace!(fd = sock.as_raw_fd(), "closing socket");
        }
        *slot = SockState::Closed;
    }

    /// Duplicate the socket: a new wrapper over a duplicated descriptor.
    ///
    /// # Errors
    ///
    /// EBADF once closed; otherwise the `dup(2)` failure.
    pub fn dup(&self) -> io::Result<Socket> {
        let sock = self.with_sock(SysSocket::try_clone)?;
        Socket::from_sys(sock, self.family, self.kind, self.protocol)
    }

    /// A buffered file-like facade over a duplicate of this socket.
    ///
    /// # Errors
    ///
    /// As [`Socket::dup`].
    pub fn makefile(&self) -> io::Result<SocketFile> {
        Ok(SocketFile {
            sock: self.dup()?,
            rbuf: Vec::new(),
        })
    }

    /// `true` puts the socket into wait-forever mode, `false` into pure
    /// non-blocking mode.
    pub fn setblocking(&self, blocking: bool) {
        self.timeout
            .set(if blocking { None } else { Some(Duration::ZERO) });
    }

    pub fn settimeout(&self, timeout: Option<Duration>) {
        self.timeout.set(timeout);
    }

    pub fn gettimeout(&self) -> Option<Duration> {
        self.timeout.get()
    }

    /// The raw descriptor.
    ///
    /// # Errors
    ///
    /// EBADF once closed.
    pub fn fileno(&self) -> io::Result<RawFd> {
        self.with_sock(|s| Ok(s.as_raw_fd()))
    }

    /// # Errors
    ///
    /// EBADF once closed; otherwise the OS error.
    pub fn getsockname(&self) -> io::Result<SockAddr> {
        self.with_sock(SysSocket::local_addr)
    }

    /// # Errors
    ///
    /// EBADF once closed; otherwise the OS error.
    pub fn getpeername(&self) -> io::Result<SockAddr> {
        self.with_sock(SysSocket::peer_addr)
    }

    /// # Errors
    ///
    /// EBADF once closed; otherwise the OS error.
    pub fn bind(&self, addr: &SockAddr) -> io::Result<()> {
        self.with_sock(|s| s.bind(addr))
    }

    /// # Errors
    ///
    /// EBADF once closed; otherwise the OS error.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.with_sock(|s| s.listen(backlog))
    }

    /// # Errors
    ///
    /// EBADF once closed; otherwise the OS error.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.with_sock(|s| s.shutdown(how))
    }

    /// # Errors
    ///
    /// EBADF once closed; otherwise the OS error.
    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.with_sock(|s| s.set_reuse_address(reuse))
    }

    /// Read and clear the pending socket error (`SO_ERROR`).
    ///
    /// # Errors
    ///
    /// EBADF once closed; otherwise the OS error.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.with_sock(SysSocket::take_error)
    }

    async fn wait_readable(&self) -> Result<()> {
        wait_read(
            self.fileno()?,
            self.timeout.get(),
            TimeoutExpired::new().into(),
        )
        .await
    }

    fn never_waits(&self) -> bool {
        self.timeout.get() == Some(Duration::ZERO)
    }

    fn with_sock<R>(&self, f: impl FnOnce(&SysSocket) -> io::Result<R>) -> io::Result<R> {
        match &*self.sock.borrow() {
            SockState::Open(sock) => f(sock),
            SockState::Closed => Err(closed()),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Socket");
        match self.fileno() {
            Ok(fd) => s.field("fd", &fd),
            Err(_) => s.field("fd", &"closed"),
        };
        if let Ok(addr) = self.getsockname() {
            s.field("sock", &addr.as_socket());
        }
        if let Ok(addr) = self.getpeername() {
            s.field("peer", &addr.as_socket());
        }
        s.field("timeout", &self.timeout.get()).finish()
    }
}

// === impl SocketFile ===

/// Buffered reader/writer over a duplicated cooperative socket, the
/// file-object counterpart of [`Socket::makefile`].
pub struct SocketFile {
    sock: Socket,
    rbuf: Vec<u8>,
}

impl SocketFile {
    /// Read up to and including the next newline; the remaining buffered
    /// bytes on EOF.
    ///
    /// # Errors
    ///
    /// As [`Socket::recv`].
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.rbuf.iter().position(|&b| b == b'\n') {
                return Ok(self.rbuf.drain(..=pos).collect());
            }
            let chunk = self.sock.recv(4096).await?;
            if chunk.is_empty() {
                return Ok(std::mem::take(&mut self.rbuf));
            }
            self.rbuf.extend_from_slice(&chunk);
        }
    }

    /// Read exactly `n` bytes.
    ///
    /// # Errors
    ///
    /// As [`Socket::recv`]; `UnexpectedEof` when the peer closes first.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.rbuf.len() < n {
            let chunk = self.sock.recv(4096).await?;
            if chunk.is_empty() {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            self.rbuf.extend_from_slice(&chunk);
        }
        Ok(self.rbuf.drain(..n).collect())
    }

    /// Write the whole buffer.
    ///
    /// # Errors
    ///
    /// As [`Socket::sendall`].
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.sock.sendall(buf).await
    }

    pub fn socket(&self) -> &Socket {
        &self.sock
    }
}

/// A connected pair of cooperative sockets.
///
/// # Errors
///
/// Propagates `socketpair(2)` failures.
#[cfg(unix)]
pub fn socketpair(
    family: Domain,
    kind: Type,
    protocol: Option<Protocol>,
) -> io::Result<(Socket, Socket)> {
    let (a, b) = SysSocket::pair(family, kind, protocol)?;
    Ok((
        Socket::from_sys(a, family, kind, protocol)?,
        Socket::from_sys(b, family, kind, protocol)?,
    ))
}

/// Bind `sock` to `addr` and put it into listening state, optionally
/// setting `SO_REUSEADDR` first (failures to set it are ignored).
///
/// # Errors
///
/// Propagates `bind(2)` and `listen(2)` failures.
pub fn bind_and_listen(
    sock: &Socket,
    addr: &SockAddr,
    backlog: i32,
    reuse_addr: bool,
) -> io::Result<()> {
    if reuse_addr {
        let _ = sock.set_reuse_address(true);
    }
    sock.bind(addr)?;
    sock.listen(backlog)
}

/// Create a TCP socket, bind it and put it into listening state.
///
/// # Errors
///
/// Propagates socket creation, `bind(2)` and `listen(2)` failures.
pub fn tcp_listener(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let family = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(family, Type::STREAM, Some(Protocol::TCP))?;
    bind_and_listen(&sock, &SockAddr::from(addr), backlog, true)?;
    Ok(sock)
}

/// One resolved endpoint, as produced by [`getaddrinfo`].
#[derive(Clone, Debug)]
pub struct AddrInfo {
    pub family: Domain,
    pub kind: Type,
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

/// Resolve `host:port` through the OS resolver.
///
/// Resolution happens synchronously and blocks the hub. An unspecified
/// family resolves IPv4 only, and there is no flags argument; both are
/// known limitations of this resolver shim.
///
/// # Errors
///
/// Resolution failures pass through as the OS resolver reported them.
pub fn getaddrinfo(
    host: &str,
    port: u16,
    family: Option<Domain>,
    kind: Option<Type>,
) -> io::Result<Vec<AddrInfo>> {
    let mut out = Vec::new();
    for addr in (host, port).to_socket_addrs()? {
        let fam = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let family_matches = match family {
            None => addr.is_ipv4(),
            Some(want) => want == fam,
        };
        if !family_matches {
            continue;
        }
        for (k, p) in [(Type::STREAM, Protocol::TCP), (Type::DGRAM, Protocol::UDP)] {
            if kind.is_none_or(|want| want == k) {
                out.push(AddrInfo {
                    family: fam,
                    kind: k,
                    protocol: p,
                    addr,
                });
            }
        }
    }
    Ok(out)
}

/// Connect to `host:port` and return the connected socket.
///
/// Tries every resolved endpoint in order, closing failed attempts; the
/// first successful connect wins.
///
/// # Errors
///
/// The resolution failure, or the last connect error when every endpoint
/// fails.
pub async fn create_connection(host: &str, port: u16, timeout: Option<Duration>) -> Result<Socket> {
    let mut last: Option<Error> = None;
    for info in getaddrinfo(host, port, None, Some(Type::STREAM))? {
        let sock = match Socket::new(info.family, info.kind, Some(info.protocol)) {
            Ok(sock) => sock,
            Err(err) => {
                last = Some(err.into());
                continue;
            }
        };
        sock.settimeout(timeout);
        match sock.connect(&SockAddr::from(info.addr)).await {
            Ok(()) => return Ok(sock),
            Err(err) => {
                sock.close();
                last = Some(err);
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow!("name resolution returned no addresses")))
}

fn closed() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Whether a connect attempt's errno means "in progress, wait and retry".
fn connect_in_progress(errno: i32) -> bool {
    cfg_if::cfg_if! {
        if #[cfg(windows)] {
            // WSAEINVAL is how Winsock reports a connect already in flight
            errno == libc::EWOULDBLOCK
                || errno == libc::EINPROGRESS
                || errno == libc::EALREADY
                || errno == libc::EINVAL
        } else {
            errno == libc::EWOULDBLOCK
                || errno == libc::EAGAIN
                || errno == libc::EINPROGRESS
                || errno == libc::EALREADY
        }
    }
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // Safety: u8 and MaybeUninit<u8> have identical layout, and the receive
    // calls only ever write initialized bytes into the buffer.
    unsafe { &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>]) }
}
