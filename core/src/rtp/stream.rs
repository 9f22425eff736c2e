//! RTP stream / sender (SPEC_FULL.md §4.8).
//!
//! Owns one media direction: header state, optional reliable-UDP
//! retransmission, receiver-side statistics fed by inbound RTCP, and the
//! thinning "quality level" a reflector or live encoder can consult to
//! decide how much to send. Grounded in the same
//! `RTPStream.cpp`/`RTPBandwidthTracker.h` lineage as [`super::retransmit`];
//! RTCP ingest dispatches through [`super::rtcp::parse_compound`].

use std::net::SocketAddr;

use crate::media::rtp::RtpHeader;
use crate::net::socket::{IoOutcome, Socket};
use crate::rtp::retransmit::RtpResender;
use crate::rtp::rtcp::RtcpReport;

/// Receiver-observed quality signal parsed from `APP(QTSS)`/`APP(PSS0)`
/// feedback, consumed by an external quality controller (spec.md §4.8:
/// "external but with documented signals").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualitySignal {
    GettingBetter,
    GettingWorse,
    Steady,
}

/// Aggregate stats exposed by [`RtpStream::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_lost_pct: f32,
    pub rtt_ms: u32,
    pub avg_bitrate_bps: u64,
    pub total_rtcp_bytes_recv: u64,
}

/// Default age limit for a retransmit-tracked packet: how long the
/// sender keeps a copy around hoping for an ack before giving up on it
/// as unrecoverably late for playout.
const DEFAULT_RETRANSMIT_AGE_LIMIT_MS: i64 = 5_000;

/// One outbound media direction (one RTP/RTCP socket pair, one SSRC).
pub struct RtpStream {
    header: RtpHeader,
    resender: Option<RtpResender>,
    quality_level: u8,
    max_quality_level: u8,
    stats: StreamStats,
    bitrate_window_start_ms: u64,
    bitrate_window_bytes: u64,
    retransmit_age_limit_ms: i64,
}

impl RtpStream {
    pub fn new(payload_type: u8, reliable: bool, max_quality_level: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(payload_type),
            resender: reliable.then(RtpResender::new),
            quality_level: 0,
            max_quality_level,
            stats: StreamStats::default(),
            bitrate_window_start_ms: crate::time::milliseconds(),
            bitrate_window_bytes: 0,
            retransmit_age_limit_ms: DEFAULT_RETRANSMIT_AGE_LIMIT_MS,
        }
    }

    /// Set how long (ms) a retransmit-tracked packet is kept before being
    /// given up on as too late for playout. Typically driven by a
    /// client's `x-Retransmit` window parameter.
    pub fn set_retransmit_age_limit_ms(&mut self, age_limit_ms: i64) {
        self.retransmit_age_limit_ms = age_limit_ms;
    }

    /// Client-advertised retransmit receive window, in bytes.
    pub fn set_retransmit_window_bytes(&mut self, bytes: u32) {
        if let Some(resender) = &mut self.resender {
            resender.set_client_window_bytes(bytes);
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn quality_level(&self) -> u8 {
        self.quality_level
    }

    /// Send one payload. Prepends the 12-byte RTP fixed header, advances
    /// the timestamp, and either queues the packet for retransmit
    /// tracking (reliable UDP, C9) or sends it directly.
    pub fn send(
        &mut self,
        socket: &Socket,
        dest: SocketAddr,
        payload: &[u8],
        mark_bit: bool,
        timestamp_increment: u32,
    ) -> std::io::Result<usize> {
        let seq = self.header.sequence();
        let rtp_header = self.header.write(mark_bit);
        self.header.advance_timestamp(timestamp_increment);

        let mut datagram = Vec::with_capacity(12 + payload.len());
        datagram.extend_from_slice(&rtp_header);
        datagram.extend_from_slice(payload);

        let sent = socket.send_to(&datagram, dest)?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += sent as u64;
        self.bitrate_window_bytes += sent as u64;
        self.refresh_bitrate_estimate();

        if let Some(resender) = &mut self.resender {
            resender.add_packet(seq, datagram, self.retransmit_age_limit_ms);
        }

        Ok(sent)
    }

    fn refresh_bitrate_estimate(&mut self) {
        let now = crate::time::milliseconds();
        let elapsed_ms = now.saturating_sub(self.bitrate_window_start_ms);
        if elapsed_ms >= 1000 {
            self.stats.avg_bitrate_bps = (self.bitrate_window_bytes * 8 * 1000) / elapsed_ms.max(1);
            self.bitrate_window_bytes = 0;
            self.bitrate_window_start_ms = now;
        }
    }

    /// Dispatch an inbound RTCP datagram: parses the compound packet,
    /// updates loss/jitter/RTT stats, acknowledges outstanding
    /// retransmit-tracked packets, and derives a quality signal from any
    /// `APP(QTSS)`/`APP(PSS0)` feedback present.
    pub fn on_rtcp(&mut self, bytes: &[u8]) -> QualitySignal {
        self.stats.total_rtcp_bytes_recv += bytes.len() as u64;
        let mut signal = QualitySignal::Steady;

        for report in crate::rtp::rtcp::parse_compound(bytes) {
            match report {
                RtcpReport::ReceiverReport(rr) => {
                    if let Some(block) = rr.report_blocks.first() {
                        self.stats.packets_lost_pct = (block.fraction_lost as f32 / 256.0) * 100.0;
                        if self.stats.packets_lost_pct > 5.0 {
                            signal = QualitySignal::GettingWorse;
                        } else if self.stats.packets_lost_pct < 0.5 {
                            signal = QualitySignal::GettingBetter;
                        }
                    }
                    if let Some(resender) = &mut self.resender {
                        if let Some(block) = rr.report_blocks.first() {
                            resender.ack_through(block.highest_sequence as u16);
                        }
                    }
                }
                RtcpReport::AppNadu(nadu) => {
                    if nadu.blocks.iter().any(|b| b.num_units_needed > 0) {
                        signal = QualitySignal::GettingWorse;
                    }
                    if let Some(block) = nadu.blocks.first() {
                        self.stats.rtt_ms = block.playout_delay_ms as u32;
                    }
                }
                RtcpReport::AppQtss(qtss) => {
                    if qtss.is_getting_worse() {
                        signal = QualitySignal::GettingWorse;
                    } else if qtss.is_getting_better() {
                        signal = QualitySignal::GettingBetter;
                    }
                }
                _ => {}
            }
        }

        self.apply_quality_signal(signal);
        signal
    }

    fn apply_quality_signal(&mut self, signal: QualitySignal) {
        match signal {
            QualitySignal::GettingWorse if self.quality_level < self.max_quality_level => {
                self.quality_level += 1;
            }
            QualitySignal::GettingBetter if self.quality_level > 0 => {
                self.quality_level -= 1;
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Outstanding packets whose retransmit timeout has elapsed. Resend
    /// bookkeeping (resend count, RTO backoff, congestion-window
    /// halving) is already applied by the time these are returned; the
    /// caller only needs to put the bytes back on the wire.
    pub fn resend_due(&mut self) -> Vec<(u16, Vec<u8>)> {
        self.resender
            .as_mut()
            .map(|r| r.resend_due())
            .unwrap_or_default()
    }

    /// Whether the retransmit congestion window is currently full —
    /// callers should hold off enqueuing new reliable packets.
    pub fn is_flow_controlled(&self) -> bool {
        self.resender.as_ref().is_some_and(|r| r.is_flow_controlled())
    }
}
