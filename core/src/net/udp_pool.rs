//! UDP socket-pair pool (SPEC_FULL.md §4.4).
//!
//! Hands out `(RTP socket, RTCP socket)` bound to adjacent UDP ports on a
//! given local IP, deduplicated when safe and reference-counted. Grounded
//! in `original_source/CommonUtilitiesLib/UDPSocketPool.cpp`'s
//! `GetUDPSocketPair`/`CreateUDPSocketPair` algorithm: port range
//! 6970-65535, step-by-2 linear scan, and the exact-or-wildcard demuxer
//! conflict check on reuse.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{UDP_PORT_RANGE_MAX, UDP_PORT_RANGE_MIN};
use crate::error::{Result, RtspError};
use crate::net::demux::Demuxer;
use crate::net::socket::Socket;

/// A bound, reference-counted `(RTP, RTCP)` socket pair on adjacent ports.
pub struct SocketPair {
    pub rtp_socket: Socket,
    pub rtcp_socket: Socket,
    pub local_ip: IpAddr,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub rtp_demux: Demuxer<String>,
    pub rtcp_demux: Demuxer<String>,
    refcount: Mutex<usize>,
}

impl SocketPair {
    fn bind(local_ip: IpAddr, rtp_port: u16) -> std::io::Result<Self> {
        let rtp_socket = Socket::bind_udp(SocketAddr::new(local_ip, rtp_port))?;
        let rtcp_socket = Socket::bind_udp(SocketAddr::new(local_ip, rtp_port + 1))?;
        let bound_rtp_port = rtp_socket.local_addr()?.port();
        let bound_rtcp_port = rtcp_socket.local_addr()?.port();
        Ok(Self {
            rtp_socket,
            rtcp_socket,
            local_ip,
            rtp_port: bound_rtp_port,
            rtcp_port: bound_rtcp_port,
            rtp_demux: Demuxer::new(),
            rtcp_demux: Demuxer::new(),
            refcount: Mutex::new(1),
        })
    }

    pub fn refcount(&self) -> usize {
        *self.refcount.lock()
    }
}

/// Pool of [`SocketPair`]s, one entry per live allocation.
pub struct UdpSocketPool {
    pairs: Mutex<Vec<Arc<SocketPair>>>,
    port_range: std::ops::RangeInclusive<u16>,
}

impl UdpSocketPool {
    pub fn new() -> Self {
        Self::with_port_range(UDP_PORT_RANGE_MIN..=UDP_PORT_RANGE_MAX)
    }

    pub fn with_port_range(port_range: std::ops::RangeInclusive<u16>) -> Self {
        Self {
            pairs: Mutex::new(Vec::new()),
            port_range,
        }
    }

    /// Acquire a socket pair, reusing an existing one when safe.
    ///
    /// `port_hint == 0` means "any port"; otherwise only that exact RTP
    /// port is tried/matched. `src_ip`/`src_port` identify the remote peer
    /// this allocation is for — `(0, 0)` means "unknown source yet"
    /// (push/ANNOUNCE path), in which case reuse is never attempted
    /// (SPEC_FULL.md §4.4: reuse scanning is gated on `src_ip != 0 || src_port != 0`).
    pub fn get_pair(
        &self,
        local_ip: IpAddr,
        port_hint: u16,
        src_ip: IpAddr,
        src_port: u16,
    ) -> Result<Arc<SocketPair>> {
        let src_is_known = !src_ip.is_unspecified() || src_port != 0;

        if src_is_known {
            let pairs = self.pairs.lock();
            for pair in pairs.iter() {
                if pair.local_ip != local_ip {
                    continue;
                }
                if port_hint != 0 && pair.rtp_port != port_hint {
                    continue;
                }
                if pair.rtcp_demux.contains_exact_or_wildcard(src_ip, src_port) {
                    continue;
                }
                *pair.refcount.lock() += 1;
                return Ok(pair.clone());
            }
        }

        self.allocate(local_ip, port_hint)
    }

    fn allocate(&self, local_ip: IpAddr, port_hint: u16) -> Result<Arc<SocketPair>> {
        let mut pairs = self.pairs.lock();

        if port_hint != 0 {
            let pair = SocketPair::bind(local_ip, port_hint)
                .map_err(|_| RtspError::PortRangeExhausted)?;
            let pair = Arc::new(pair);
            pairs.push(pair.clone());
            return Ok(pair);
        }

        let mut candidate = *self.port_range.start();
        if candidate % 2 != 0 {
            candidate += 1;
        }
        let end = *self.port_range.end();

        while candidate < end {
            if let Ok(pair) = SocketPair::bind(local_ip, candidate) {
                let pair = Arc::new(pair);
                pairs.push(pair.clone());
                return Ok(pair);
            }
            candidate += 2;
        }

        Err(RtspError::PortRangeExhausted)
    }

    /// Release one reference to `pair`; at refcount zero it is dropped from
    /// the pool (closing both sockets).
    pub fn release(&self, pair: &Arc<SocketPair>) {
        let mut pairs = self.pairs.lock();
        let mut count = pair.refcount.lock();
        *count -= 1;
        if *count == 0 {
            drop(count);
            pairs.retain(|p| !Arc::ptr_eq(p, pair));
        }
    }

    /// Number of live pairs currently held (test/diagnostic helper).
    pub fn live_pair_count(&self) -> usize {
        self.pairs.lock().len()
    }
}

impl Default for UdpSocketPool {
    fn default() -> Self {
        Self::new()
    }
}
