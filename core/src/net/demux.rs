//! Source-address demuxer (SPEC_FULL.md §4.5).
//!
//! Per RTP/RTCP socket, a thread-safe `(remote_ip, remote_port) -> stream`
//! map used to route an inbound datagram to the logical stream that owns
//! it. One lock per socket's demuxer; contended only during SETUP and
//! inbound packet dispatch.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;

/// The wildcard key `(0.0.0.0, 0)` — "accept any source, route to this stream".
/// Conflicts with every non-wildcard entry during pair-reuse checks (C4).
pub const WILDCARD: (IpAddr, u16) = (IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);

/// A single UDP socket's source-address routing table.
pub struct Demuxer<T> {
    entries: RwLock<HashMap<(IpAddr, u16), T>>,
}

impl<T: Clone> Demuxer<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `stream` under `(remote_ip, remote_port)`. Overwrites any
    /// existing registration at the same key (SPEC_FULL.md §3 invariant:
    /// keys are unique per demuxer).
    pub fn register(&self, remote_ip: IpAddr, remote_port: u16, stream: T) {
        self.entries.write().insert((remote_ip, remote_port), stream);
    }

    /// Remove the registration at `(remote_ip, remote_port)`, if any.
    pub fn unregister(&self, remote_ip: IpAddr, remote_port: u16) {
        self.entries.write().remove(&(remote_ip, remote_port));
    }

    /// Look up the stream owning `(remote_ip, remote_port)`.
    pub fn get(&self, remote_ip: IpAddr, remote_port: u16) -> Option<T> {
        self.entries.read().get(&(remote_ip, remote_port)).cloned()
    }

    /// Whether this demuxer has an entry at the exact key or the wildcard key.
    ///
    /// Used by [`super::udp_pool::UdpSocketPool::get_pair`] to decide whether
    /// a pool pair is safe to reuse for a new `(src_ip, src_port)`.
    pub fn contains_exact_or_wildcard(&self, remote_ip: IpAddr, remote_port: u16) -> bool {
        let entries = self.entries.read();
        entries.contains_key(&(remote_ip, remote_port)) || entries.contains_key(&WILDCARD)
    }

    /// Number of live entries (diagnostic / test helper).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for Demuxer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn register_get_unregister() {
        let demux: Demuxer<&'static str> = Demuxer::new();
        demux.register(ip(1), 6970, "stream-a");
        assert_eq!(demux.get(ip(1), 6970), Some("stream-a"));
        demux.unregister(ip(1), 6970);
        assert_eq!(demux.get(ip(1), 6970), None);
    }

    #[test]
    fn no_two_entries_share_a_key() {
        let demux: Demuxer<&'static str> = Demuxer::new();
        demux.register(ip(1), 6970, "first");
        demux.register(ip(1), 6970, "second");
        assert_eq!(demux.len(), 1);
        assert_eq!(demux.get(ip(1), 6970), Some("second"));
    }

    #[test]
    fn wildcard_satisfies_contains_check_for_any_source() {
        let demux: Demuxer<&'static str> = Demuxer::new();
        demux.register(WILDCARD.0, WILDCARD.1, "any");
        assert!(demux.contains_exact_or_wildcard(ip(42), 9999));
    }

    #[test]
    fn exact_match_without_wildcard() {
        let demux: Demuxer<&'static str> = Demuxer::new();
        demux.register(ip(1), 6970, "a");
        assert!(demux.contains_exact_or_wildcard(ip(1), 6970));
        assert!(!demux.contains_exact_or_wildcard(ip(2), 6970));
    }
}
