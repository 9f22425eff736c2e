//! Reliable-UDP retransmission (SPEC_FULL.md §4.9).
//!
//! Tracks unacknowledged RTP packets per stream and decides when to
//! resend them, using a Karn's-algorithm-style RTT estimator (ignore RTT
//! samples from retransmitted packets) and Van Jacobson congestion
//! avoidance for both the retransmit timeout and the sender's congestion
//! window. Grounded in
//! `original_source/CommonUtilitiesLib/RTPBandwidthTracker.h` and
//! `RTPPacketResender.cpp` — constants and the smoothed-RTT update carried
//! over bit-for-bit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Maximum segment size assumed for congestion-window bookkeeping.
pub const MAX_SEGMENT_SIZE: u32 = 1466;
/// Floor on the retransmit timeout, regardless of the smoothed estimate.
pub const MIN_RETRANSMIT_INTERVAL_MS: u32 = 600;
/// Ceiling on the retransmit timeout.
pub const MAX_RETRANSMIT_INTERVAL_MS: u32 = 24_000;
/// When the outstanding-packet array grows, it grows by this many slots.
pub const PACKET_ARRAY_INCREASE_INTERVAL: usize = 32;
/// Initial capacity reserved for the outstanding-packet array.
pub const INITIAL_PACKET_ARRAY_SIZE: usize = 64;
/// Default client-advertised window, used until a `x-Retransmit` window
/// parameter overrides it.
const DEFAULT_CLIENT_WINDOW_BYTES: u32 = MAX_SEGMENT_SIZE * 64;
/// Default slow-start threshold, generous until the first loss event.
const DEFAULT_SSTHRESH_BYTES: u32 = MAX_SEGMENT_SIZE * 64;

/// Process-wide count of buffer bytes over-allocated by array growth
/// (diagnostic only, mirrors the source's `sNumWastedBytes`).
static WASTED_BYTES: AtomicU64 = AtomicU64::new(0);

/// Total wasted bytes across every [`RtpResender`] in this process.
pub fn wasted_bytes() -> u64 {
    WASTED_BYTES.load(Ordering::Relaxed)
}

/// One packet sent but not yet acknowledged or retired.
#[derive(Debug, Clone)]
struct RetransmitEntry {
    sequence_number: u16,
    payload: Vec<u8>,
    added_at: Instant,
    expire_at: Instant,
    orig_rto_ms: u32,
    num_resends: u32,
}

/// Karn/Van-Jacobson RTT estimator and congestion window, one per reliable
/// stream (SPEC_FULL.md §3 `BandwidthTracker`).
#[derive(Debug, Clone)]
pub struct BandwidthTracker {
    smoothed_rtt_ms: f64,
    rtt_variance_ms: f64,
    have_rtt_sample: bool,
    cwnd_bytes: u32,
    ssthresh_bytes: u32,
    client_window_bytes: u32,
    bytes_in_list: u32,
    in_slow_start: bool,
}

impl BandwidthTracker {
    fn new() -> Self {
        Self {
            smoothed_rtt_ms: MIN_RETRANSMIT_INTERVAL_MS as f64 / 2.0,
            rtt_variance_ms: 0.0,
            have_rtt_sample: false,
            cwnd_bytes: MAX_SEGMENT_SIZE,
            ssthresh_bytes: DEFAULT_SSTHRESH_BYTES,
            client_window_bytes: DEFAULT_CLIENT_WINDOW_BYTES,
            bytes_in_list: 0,
            in_slow_start: true,
        }
    }

    /// Current retransmit timeout estimate: `srtt + 4*rttvar`, clamped to
    /// `[MIN_RETRANSMIT_INTERVAL_MS, MAX_RETRANSMIT_INTERVAL_MS]`.
    pub fn rto_ms(&self) -> u32 {
        let rto = self.smoothed_rtt_ms + 4.0 * self.rtt_variance_ms;
        (rto.round() as u32).clamp(MIN_RETRANSMIT_INTERVAL_MS, MAX_RETRANSMIT_INTERVAL_MS)
    }

    pub fn cwnd_bytes(&self) -> u32 {
        self.cwnd_bytes
    }

    pub fn ssthresh_bytes(&self) -> u32 {
        self.ssthresh_bytes
    }

    pub fn bytes_in_list(&self) -> u32 {
        self.bytes_in_list
    }

    pub fn client_window_bytes(&self) -> u32 {
        self.client_window_bytes
    }

    pub fn set_client_window_bytes(&mut self, bytes: u32) {
        self.client_window_bytes = bytes.max(MAX_SEGMENT_SIZE);
    }

    /// `bytes_in_list >= cwnd` — the sender should stop enqueuing new
    /// packets until an ack opens the window.
    pub fn is_flow_controlled(&self) -> bool {
        self.bytes_in_list >= self.cwnd_bytes.min(self.client_window_bytes)
    }

    fn record_rtt_sample(&mut self, sample_ms: f64) {
        if !self.have_rtt_sample {
            self.smoothed_rtt_ms = sample_ms;
            self.rtt_variance_ms = sample_ms / 2.0;
            self.have_rtt_sample = true;
            return;
        }
        let delta = sample_ms - self.smoothed_rtt_ms;
        self.smoothed_rtt_ms += delta / 8.0;
        self.rtt_variance_ms += (delta.abs() - self.rtt_variance_ms) / 4.0;
    }

    /// Open the congestion window by `acked_bytes`: slow start adds one
    /// MSS per ack until `cwnd >= ssthresh`, then AIMD adds `MSS*MSS/cwnd`.
    fn open_window(&mut self, acked_bytes: u32) {
        let _ = acked_bytes;
        if self.in_slow_start {
            self.cwnd_bytes += MAX_SEGMENT_SIZE;
            if self.cwnd_bytes >= self.ssthresh_bytes {
                self.in_slow_start = false;
            }
        } else {
            let increment = (MAX_SEGMENT_SIZE as u64 * MAX_SEGMENT_SIZE as u64
                / self.cwnd_bytes.max(1) as u64) as u32;
            self.cwnd_bytes += increment.max(1);
        }
    }

    /// Halve the window on a retransmit and drop out of slow start
    /// (SPEC_FULL.md §4.9 "On retransmit").
    fn on_retransmit(&mut self) {
        self.ssthresh_bytes = (self.cwnd_bytes / 2).max(2 * MAX_SEGMENT_SIZE);
        self.cwnd_bytes = MAX_SEGMENT_SIZE;
        self.in_slow_start = false;
    }
}

impl Default for BandwidthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stream retransmit queue and RTT/congestion estimator.
///
/// `add_packet` is called for every packet transmitted; `ack_packet`
/// retires one sequence number (hit or miss); `resend_due` is polled by
/// the caller's send loop to find packets whose retransmit timeout has
/// elapsed and resend them.
pub struct RtpResender {
    entries: VecDeque<RetransmitEntry>,
    tracker: BandwidthTracker,
    max_outstanding: usize,
    expired: u64,
}

impl RtpResender {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(INITIAL_PACKET_ARRAY_SIZE),
            tracker: BandwidthTracker::new(),
            max_outstanding: INITIAL_PACKET_ARRAY_SIZE,
            expired: 0,
        }
    }

    pub fn tracker(&self) -> &BandwidthTracker {
        &self.tracker
    }

    pub fn set_client_window_bytes(&mut self, bytes: u32) {
        self.tracker.set_client_window_bytes(bytes);
    }

    /// Count of packets dropped for exceeding their age limit before
    /// being acknowledged.
    pub fn expired_count(&self) -> u64 {
        self.expired
    }

    /// Record a freshly sent (never-before-retransmitted) packet.
    ///
    /// `age_limit_ms <= 0` drops the packet immediately and counts it as
    /// expired — matching a caller that has already decided this packet
    /// is too stale to be worth tracking.
    pub fn add_packet(&mut self, sequence_number: u16, payload: Vec<u8>, age_limit_ms: i64) {
        if age_limit_ms <= 0 {
            self.expired += 1;
            return;
        }

        if self.entries.len() >= self.max_outstanding {
            WASTED_BYTES.fetch_add(
                (PACKET_ARRAY_INCREASE_INTERVAL * MAX_SEGMENT_SIZE as usize) as u64,
                Ordering::Relaxed,
            );
            self.max_outstanding += PACKET_ARRAY_INCREASE_INTERVAL;
        }

        let now = Instant::now();
        self.tracker.bytes_in_list += payload.len() as u32;
        self.entries.push_back(RetransmitEntry {
            sequence_number,
            payload,
            added_at: now,
            expire_at: now + Duration::from_millis(age_limit_ms as u64),
            orig_rto_ms: self.tracker.rto_ms(),
            num_resends: 0,
        });
    }

    /// Acknowledge one sequence number.
    ///
    /// Hit (the sequence number is still outstanding): feeds an RTT
    /// sample only if the entry was never retransmitted (Karn's
    /// algorithm), opens the congestion window by the entry's size, and
    /// retires it. Miss (already retired, or never sent — a duplicate
    /// ack): reopens the window by one MSS without touching RTT, since a
    /// retransmitted packet's ack is ambiguous about which copy arrived.
    ///
    /// Returns `true` on a hit, `false` on a miss.
    pub fn ack_packet(&mut self, sequence_number: u16) -> bool {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.sequence_number == sequence_number)
        else {
            self.tracker.open_window(MAX_SEGMENT_SIZE);
            return false;
        };

        let entry = self.entries.remove(pos).unwrap();
        self.tracker.bytes_in_list = self.tracker.bytes_in_list.saturating_sub(entry.payload.len() as u32);

        if entry.num_resends == 0 {
            let sample_ms = Instant::now().duration_since(entry.added_at).as_secs_f64() * 1000.0;
            self.tracker.record_rtt_sample(sample_ms);
        }
        self.tracker.open_window(entry.payload.len() as u32);
        true
    }

    /// Scan the queue for entries whose retransmit timeout has elapsed.
    /// Entries past their age limit are dropped and counted as expired
    /// instead of resent; everything else is returned for the caller to
    /// resend, with its resend bookkeeping already applied.
    pub fn resend_due(&mut self) -> Vec<(u16, Vec<u8>)> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut retired_bytes: u32 = 0;
        let tracker = &mut self.tracker;
        let expired = &mut self.expired;

        self.entries.retain_mut(|entry| {
            let timeout = Duration::from_millis(entry.orig_rto_ms as u64);
            if now.duration_since(entry.added_at) < timeout {
                return true;
            }
            if now > entry.expire_at {
                *expired += 1;
                retired_bytes += entry.payload.len() as u32;
                return false;
            }

            entry.num_resends += 1;
            if entry.num_resends == 1 {
                entry.orig_rto_ms = ((entry.orig_rto_ms as f64 * 1.5) as u32)
                    .clamp(MIN_RETRANSMIT_INTERVAL_MS, MAX_RETRANSMIT_INTERVAL_MS);
            }
            entry.added_at = now;
            // Each retransmitted entry is its own congestion event
            // (SPEC_FULL.md §4.9 "On retransmit"), not just the sweep.
            tracker.on_retransmit();
            due.push((entry.sequence_number, entry.payload.clone()));
            true
        });

        tracker.bytes_in_list = tracker.bytes_in_list.saturating_sub(retired_bytes);
        due
    }

    /// Drop every outstanding entry, refunding their bytes from the
    /// congestion accounting (e.g. on TEARDOWN).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.tracker.bytes_in_list = 0;
    }

    pub fn outstanding_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.tracker.is_flow_controlled()
    }

    /// Acknowledge every outstanding entry up to and including `through`,
    /// as implied by a Receiver Report's cumulative `highest_sequence`
    /// field. Wraparound-tolerant. Returns the number of entries retired.
    pub fn ack_through(&mut self, through: u16) -> usize {
        let due: Vec<u16> = self
            .entries
            .iter()
            .map(|e| e.sequence_number)
            .filter(|&seq| seq_leq(seq, through))
            .collect();
        let mut retired = 0;
        for seq in due {
            if self.ack_packet(seq) {
                retired += 1;
            }
        }
        retired
    }
}

/// `a <= b` under RTP's 16-bit wraparound sequence-number ordering.
fn seq_leq(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < 0x8000
}

impl Default for RtpResender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn default_rto_is_clamped_to_minimum() {
        let resender = RtpResender::new();
        assert!(resender.tracker().rto_ms() >= MIN_RETRANSMIT_INTERVAL_MS);
    }

    #[test]
    fn ack_retires_outstanding_packet() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![1], 5_000);
        resender.add_packet(2, vec![2], 5_000);
        resender.add_packet(3, vec![3], 5_000);
        assert!(resender.ack_packet(2));
        assert_eq!(resender.outstanding_count(), 2);
    }

    #[test]
    fn ack_of_unknown_sequence_is_a_miss() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![1], 5_000);
        assert!(!resender.ack_packet(99));
        assert_eq!(resender.outstanding_count(), 1);
    }

    #[test]
    fn karns_algorithm_skips_rtt_sample_for_retransmitted_packet() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![1], 5_000);
        // Force a resend record without waiting for the real timeout.
        if let Some(entry) = resender.entries.front_mut() {
            entry.num_resends = 1;
        }
        let rto_before = resender.tracker().rto_ms();
        resender.ack_packet(1);
        assert_eq!(resender.tracker().rto_ms(), rto_before);
    }

    #[test]
    fn fresh_packet_is_not_due_immediately() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![1], 5_000);
        assert!(resender.resend_due().is_empty());
    }

    #[test]
    fn packet_becomes_due_after_timeout_elapses() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![9], 5_000);
        if let Some(entry) = resender.entries.front_mut() {
            entry.orig_rto_ms = 1;
            entry.added_at = Instant::now() - Duration::from_millis(5);
        }
        let due = resender.resend_due();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 1);
    }

    #[test]
    fn expired_packet_is_dropped_and_counted_not_resent() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![9], 5_000);
        if let Some(entry) = resender.entries.front_mut() {
            entry.orig_rto_ms = 1;
            entry.added_at = Instant::now() - Duration::from_millis(5);
            entry.expire_at = Instant::now() - Duration::from_millis(1);
        }
        let due = resender.resend_due();
        assert!(due.is_empty());
        assert_eq!(resender.expired_count(), 1);
        assert_eq!(resender.outstanding_count(), 0);
    }

    #[test]
    fn add_packet_with_nonpositive_age_limit_is_immediately_expired() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![9], 0);
        assert_eq!(resender.expired_count(), 1);
        assert_eq!(resender.outstanding_count(), 0);
    }

    #[test]
    fn bytes_in_list_matches_sum_of_live_entries() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![0; 10], 5_000);
        resender.add_packet(2, vec![0; 20], 5_000);
        resender.add_packet(3, vec![0; 5], 5_000);
        assert_eq!(resender.tracker().bytes_in_list(), 35);
        resender.ack_packet(2);
        assert_eq!(resender.tracker().bytes_in_list(), 15);
        resender.clear();
        assert_eq!(resender.tracker().bytes_in_list(), 0);
    }

    #[test]
    fn retransmit_halves_window_and_leaves_slow_start() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![0; 10], 5_000);
        let cwnd_before = resender.tracker().cwnd_bytes();
        if let Some(entry) = resender.entries.front_mut() {
            entry.orig_rto_ms = 1;
            entry.added_at = Instant::now() - Duration::from_millis(5);
        }
        resender.resend_due();
        let expected_ssthresh = (cwnd_before / 2).max(2 * MAX_SEGMENT_SIZE);
        assert_eq!(resender.tracker().ssthresh_bytes(), expected_ssthresh);
        assert_eq!(resender.tracker().cwnd_bytes(), MAX_SEGMENT_SIZE);
        assert!(resender.tracker().cwnd_bytes() <= cwnd_before.max(MAX_SEGMENT_SIZE));
    }

    #[test]
    fn two_entries_due_in_the_same_sweep_each_halve_the_window() {
        // Testable Property 6: cwnd_after <= max(cwnd_before / 2, MSS),
        // applied once per retransmitted entry, not once per sweep.
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![0; 10], 5_000);
        resender.add_packet(2, vec![0; 10], 5_000);
        let cwnd_before = resender.tracker().cwnd_bytes();
        for i in 0..2 {
            let entry = &mut resender.entries[i];
            entry.orig_rto_ms = 1;
            entry.added_at = Instant::now() - Duration::from_millis(5);
        }
        let due = resender.resend_due();
        assert_eq!(due.len(), 2);
        // Two back-to-back halvings from the same starting cwnd: each
        // individually satisfies cwnd <= max(cwnd_before/2, MSS), and since
        // cwnd_before was already one MSS, the window floors at MSS rather
        // than compounding below it.
        assert_eq!(resender.tracker().cwnd_bytes(), MAX_SEGMENT_SIZE);
        assert!(resender.tracker().cwnd_bytes() <= (cwnd_before / 2).max(MAX_SEGMENT_SIZE));
    }

    #[test]
    fn flow_controlled_once_bytes_in_list_reaches_cwnd() {
        let mut resender = RtpResender::new();
        assert!(!resender.is_flow_controlled());
        resender.add_packet(1, vec![0; MAX_SEGMENT_SIZE as usize], 5_000);
        assert!(resender.is_flow_controlled());
    }

    #[test]
    fn array_capacity_grows_in_fixed_increments() {
        let mut resender = RtpResender::new();
        for i in 0..(INITIAL_PACKET_ARRAY_SIZE + 1) {
            resender.add_packet(i as u16, vec![], 5_000);
        }
        assert_eq!(
            resender.max_outstanding,
            INITIAL_PACKET_ARRAY_SIZE + PACKET_ARRAY_INCREASE_INTERVAL
        );
    }

    #[test]
    fn sleeping_does_not_spuriously_mark_fresh_packets_due() {
        let mut resender = RtpResender::new();
        resender.add_packet(1, vec![1], 5_000);
        sleep(Duration::from_millis(5));
        assert!(resender.resend_due().is_empty());
    }
}
