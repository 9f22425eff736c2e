//! Monotonic clock and NTP/fixed-point time conversions (RFC 3550 §4).
//!
//! The server needs a cheap, monotone millisecond clock for RTO/timeout
//! math that does not jump backwards under NTP adjustment, plus the
//! NTP <-> Unix epoch offset used by RTCP Sender Reports.

use std::sync::OnceLock;
use std::time::Instant;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
pub const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

static CLOCK_ANCHOR: OnceLock<Instant> = OnceLock::new();

fn anchor() -> Instant {
    *CLOCK_ANCHOR.get_or_init(Instant::now)
}

/// Milliseconds elapsed since this process's clock was first touched.
///
/// Backed by [`Instant`], so it is monotone even if the wall clock is
/// adjusted. Call once early in `main` (or let the first caller pay the
/// one-time initialization) before timing-sensitive code relies on it.
pub fn milliseconds() -> u64 {
    anchor().elapsed().as_millis() as u64
}

/// Convert an NTP timestamp (seconds since 1900) to Unix seconds.
pub fn ntp_to_unix_secs(ntp_secs: u64) -> i64 {
    ntp_secs as i64 - NTP_UNIX_EPOCH_OFFSET as i64
}

/// Convert a Unix timestamp (seconds since 1970) to NTP seconds.
pub fn unix_to_ntp_secs(unix_secs: i64) -> u64 {
    (unix_secs + NTP_UNIX_EPOCH_OFFSET as i64) as u64
}

/// Read a big-endian `u32` from a byte slice without requiring alignment.
///
/// Strict-alignment ISAs fault on unaligned native loads; RTP/RTCP headers
/// are not naturally aligned in an arbitrary receive buffer, so every
/// multi-byte field is read through a byte-copy helper like this one.
pub fn read_u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a big-endian `u16` from a byte slice without requiring alignment.
pub fn read_u16_be(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Port of the source's `TimeMilli_To_Fixed64Secs` Apple-private fixed-point
/// conversion, preserved bit-for-bit for `RTP-Info`/NTP interoperability.
///
/// `value` is a 64-bit fixed-point quantity whose high 32 bits are whole
/// seconds and whose low 32 bits are a fractional-second remainder; this
/// returns the equivalent value in milliseconds.
pub fn milli_to_fixed64_secs(value: u64) -> u64 {
    (value >> 32) * 1000 + (((value & 0xFFFF_FFFF) * 1000) >> 32)
}
