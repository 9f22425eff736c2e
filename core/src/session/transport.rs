use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::net::udp_pool::SocketPair;

/// Negotiated RTP/RTCP transport parameters for a session (RFC 2326 §12.39).
///
/// Created during SETUP from the client's `Transport` header and the
/// server's allocated resources — either a UDP [`SocketPair`] or an
/// interleaved TCP channel pair. Used to address outbound RTP/RTCP.
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
/// ```
#[derive(Debug, Clone)]
pub struct Transport {
    /// Client's RTP receive port (UDP transports only).
    pub client_rtp_port: u16,
    /// Client's RTCP receive port (typically `client_rtp_port + 1`).
    pub client_rtcp_port: u16,
    /// Server's RTP send port (advertised to client).
    pub server_rtp_port: u16,
    /// Server's RTCP port (advertised to client).
    pub server_rtcp_port: u16,
    /// Full socket address for RTP delivery (`client_ip:client_rtp_port`).
    pub client_addr: SocketAddr,
    /// Multicast TTL, when `destination=` + a multicast address was negotiated.
    pub ttl: Option<u8>,
    /// Explicit multicast/unicast destination override from the `Transport` header.
    pub destination: Option<IpAddr>,
    /// `PLAY` (deliver to client) or `RECORD` (server consumes inbound RTP).
    pub mode: TransportMode,
    /// The bound UDP socket pair backing this transport, kept alive for the
    /// session's lifetime and released at TEARDOWN.
    pub server_pair: Option<Arc<SocketPair>>,
    /// `Some((rtp_channel, rtcp_channel))` when negotiated as RTP-over-TCP
    /// interleaved (RFC 2326 §10.12) instead of UDP.
    pub interleaved_channels: Option<(u8, u8)>,
}

/// Direction a negotiated transport carries media in (SPEC_FULL.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Play,
    Record,
}

/// One parsed entry from a (possibly comma-separated) `Transport` header.
#[derive(Debug, Clone, Default)]
pub struct TransportHeader {
    /// Client's requested RTP port (UDP transports).
    pub client_rtp_port: u16,
    /// Client's requested RTCP port (UDP transports).
    pub client_rtcp_port: u16,
    pub is_tcp: bool,
    pub interleaved_channels: Option<(u8, u8)>,
    pub mode: TransportMode,
    pub ttl: Option<u8>,
    pub destination: Option<IpAddr>,
    pub source: Option<IpAddr>,
}

impl TransportHeader {
    /// Parse a `Transport` header value (RFC 2326 §12.39).
    ///
    /// The header may list several transport specs separated by commas;
    /// per SPEC_FULL.md §4.6 they are tried in order and the first
    /// `RTP/AVP*` entry wins. `client_port=A-B` where `B != A+1` is fixed
    /// up to `A+1` silently (logged).
    pub fn parse(header: &str) -> Option<Self> {
        for spec in header.split(',') {
            let spec = spec.trim();
            if !spec.starts_with("RTP/AVP") {
                continue;
            }
            return Some(Self::parse_one(spec));
        }
        None
    }

    fn parse_one(spec: &str) -> Self {
        let mut parsed = TransportHeader::default();
        parsed.is_tcp = spec.contains("RTP/AVP/TCP");

        for part in spec.split(';') {
            let part = part.trim();

            if let Some(ports) = part.strip_prefix("client_port=") {
                if let Some((a, b)) = ports.split_once('-') {
                    if let (Ok(rtp), Ok(rtcp)) = (a.parse::<u16>(), b.parse::<u16>()) {
                        let fixed_rtcp = if rtcp != rtp + 1 {
                            tracing::warn!(rtp, rtcp, "client_port RTCP port not RTP+1, fixing up");
                            rtp + 1
                        } else {
                            rtcp
                        };
                        parsed.client_rtp_port = rtp;
                        parsed.client_rtcp_port = fixed_rtcp;
                    }
                }
            } else if let Some(channels) = part.strip_prefix("interleaved=") {
                if let Some((a, b)) = channels.split_once('-') {
                    if let (Ok(rtp_ch), Ok(rtcp_ch)) = (a.parse::<u8>(), b.parse::<u8>()) {
                        parsed.interleaved_channels = Some((rtp_ch, rtcp_ch));
                    }
                } else if let Ok(rtp_ch) = channels.parse::<u8>() {
                    parsed.interleaved_channels = Some((rtp_ch, rtp_ch + 1));
                }
            } else if let Some(mode) = part.strip_prefix("mode=") {
                parsed.mode = if mode.eq_ignore_ascii_case("RECORD") {
                    TransportMode::Record
                } else {
                    TransportMode::Play
                };
            } else if let Some(ttl) = part.strip_prefix("ttl=") {
                parsed.ttl = ttl.parse::<u8>().ok();
            } else if let Some(dest) = part.strip_prefix("destination=") {
                parsed.destination = dest.parse::<IpAddr>().ok();
            } else if let Some(source) = part.strip_prefix("source=") {
                parsed.source = source.parse::<IpAddr>().ok();
            }
        }

        parsed
    }
}
