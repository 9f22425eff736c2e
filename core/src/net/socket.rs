//! Non-blocking socket wrapper (SPEC_FULL.md §4.3).
//!
//! Wraps a `std::net::UdpSocket`/`TcpStream` in non-blocking mode and
//! normalizes OS error codes into the `WouldBlock`/`Disconnected`/`OsError`
//! contract the rest of the stack switches on, per RFC-independent failure
//! policy: EINTR is retried transparently, EAGAIN surfaces as `WouldBlock`,
//! everything else surfaces as-is.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};

/// Outcome of a non-blocking socket operation.
#[derive(Debug)]
pub enum IoOutcome<T> {
    /// The operation completed, producing `T` (bytes sent/received, etc).
    Ready(T),
    /// The operation would have blocked; retry later.
    WouldBlock,
    /// The peer is gone (TCP 0-byte read, or a UDP ICMP-port-unreachable echo).
    Disconnected,
}

/// Retry a fallible socket syscall transparently across `EINTR`, mapping
/// `EAGAIN`/`EWOULDBLOCK` to [`IoOutcome::WouldBlock`] and everything else
/// to `Err`.
pub fn retry_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<IoOutcome<T>> {
    loop {
        match op() {
            Ok(value) => return Ok(IoOutcome::Ready(value)),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(IoOutcome::WouldBlock),
            Err(e) => return Err(e),
        }
    }
}

/// A bound, non-blocking UDP socket with buffer-size tuning helpers.
///
/// The RTP/RTCP sockets handed out by [`super::udp_pool::UdpSocketPool`]
/// are wrapped in this type; it is the seam through which the pool's
/// `set_options` hook (SPEC_FULL.md §4.4, §9) tunes buffer sizes per use.
pub struct Socket {
    inner: UdpSocket,
}

impl Socket {
    /// Bind a UDP socket at `addr` (port `0` lets the OS assign one) and
    /// put it in non-blocking mode.
    pub fn bind_udp(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self { inner: socket })
    }

    /// The address the OS actually bound this socket to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Non-blocking send; distinguishes `WouldBlock` from a hard error.
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<IoOutcome<usize>> {
        retry_eintr(|| self.inner.send_to(buf, target))
    }

    /// Non-blocking receive; distinguishes `WouldBlock` from a hard error.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<IoOutcome<(usize, SocketAddr)>> {
        retry_eintr(|| self.inner.recv_from(buf))
    }

    /// Set the socket receive buffer size. Best-effort: not all platforms
    /// honor every request exactly.
    pub fn set_recv_buffer_size(&self, bytes: usize) -> io::Result<()> {
        socket2::SockRef::from(&self.inner).set_recv_buffer_size(bytes)
    }

    /// Set the socket send buffer size.
    pub fn set_send_buffer_size(&self, bytes: usize) -> io::Result<()> {
        socket2::SockRef::from(&self.inner).set_send_buffer_size(bytes)
    }

    /// Enable/disable `SO_REUSEADDR`, needed when a reflector tears down and
    /// re-binds the same port pair in quick succession.
    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        socket2::SockRef::from(&self.inner).set_reuse_address(reuse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_is_nonblocking() {
        let socket = Socket::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() > 0);

        let mut buf = [0u8; 16];
        match socket.recv_from(&mut buf).unwrap() {
            IoOutcome::WouldBlock => {}
            other => panic!("expected WouldBlock on an empty socket, got {other:?}"),
        }
    }

    #[test]
    fn send_and_receive_round_trip() {
        let a = Socket::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = Socket::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.local_addr().unwrap();

        loop {
            match a.send_to(b"hello", b_addr).unwrap() {
                IoOutcome::Ready(n) => {
                    assert_eq!(n, 5);
                    break;
                }
                IoOutcome::WouldBlock => continue,
                IoOutcome::Disconnected => panic!("udp send should not disconnect"),
            }
        }

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = [0u8; 16];
        match b.recv_from(&mut buf).unwrap() {
            IoOutcome::Ready((n, _from)) => assert_eq!(&buf[..n], b"hello"),
            other => panic!("expected a ready datagram, got {other:?}"),
        }
    }
}
