//! Non-blocking socket primitives and the UDP transport core (SPEC_FULL.md §2 C3-C5).
//!
//! - [`socket`] wraps a non-blocking TCP/UDP descriptor with the
//!   `WouldBlock`/`Disconnected` error contract the rest of the stack relies on.
//! - [`udp_pool`] hands out adjacent RTP/RTCP port pairs, deduplicated and
//!   reference-counted.
//! - [`demux`] is the per-socket `(remote_ip, remote_port) -> stream` map
//!   used to route inbound datagrams.

pub mod demux;
pub mod socket;
pub mod udp_pool;

pub use demux::Demuxer;
pub use socket::Socket;
pub use udp_pool::{SocketPair, UdpSocketPool};
