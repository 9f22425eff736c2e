//! RTCP compound-packet parsing (SPEC_FULL.md §4.10, RFC 3550 §6).
//!
//! Parses a compound RTCP packet (as delivered on the RTCP half of a
//! [`SocketPair`](crate::net::udp_pool::SocketPair), or de-interleaved off
//! channel N+1 of a TCP connection) into its component reports. Also
//! recognizes the two proprietary `APP` extensions carried by clients of
//! this lineage: `QTSS` (client quality-of-service feedback) and
//! `PSS0`/`NADU` (number-of-packets/average-delay-until-playout). Grounded
//! in `original_source/CommonUtilitiesLib/RTCPAPPQTSSPacket.h`/`.cpp` and
//! `RTCPAPPNADUPacket.cpp`.

/// One parsed report from a compound RTCP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpReport {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription { chunks: Vec<SdesChunk> },
    Bye { ssrcs: Vec<u32> },
    AppQtss(QtssAppData),
    AppNadu(NaduAppData),
    /// A well-formed header whose packet type this crate does not interpret.
    Unknown { packet_type: u8, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub report_blocks: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub report_blocks: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportBlock {
    pub source_ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_sequence: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<(u8, Vec<u8>)>,
}

/// One self-describing item inside an `APP(QTSS)` packet: a 2-character
/// ASCII tag, a version byte, and a length-prefixed value.
#[derive(Debug, Clone, PartialEq)]
pub struct QtssItem {
    pub name: [u8; 2],
    pub version: u8,
    pub value: Vec<u8>,
}

/// `APP(QTSS)` client quality-of-service report.
///
/// Name field is the literal ASCII `"QTSS"`; the body is a sequence of
/// `(name: 2 bytes, version: 1 byte, length: 1 byte, value: length bytes)`
/// items. 14 item tags are recognized; unrecognized ones are kept in
/// `items` but have no typed accessor.
#[derive(Debug, Clone, PartialEq)]
pub struct QtssAppData {
    pub ssrc: u32,
    pub items: Vec<QtssItem>,
}

impl QtssAppData {
    pub fn item(&self, name: &[u8; 2]) -> Option<&QtssItem> {
        self.items.iter().find(|i| &i.name == name)
    }

    fn u32_item(&self, name: &[u8; 2]) -> Option<u32> {
        self.item(name)
            .filter(|i| i.value.len() >= 4)
            .map(|i| u32::from_be_bytes([i.value[0], i.value[1], i.value[2], i.value[3]]))
    }

    fn u16_item(&self, name: &[u8; 2]) -> Option<u16> {
        self.item(name)
            .filter(|i| i.value.len() >= 2)
            .map(|i| u16::from_be_bytes([i.value[0], i.value[1]]))
    }

    /// `rr` — receiver's estimate of inbound bitrate, bits/sec.
    pub fn receiver_bitrate(&self) -> Option<u32> {
        self.u32_item(b"rr")
    }

    /// `lt` — average lateness of arriving packets, ms.
    pub fn avg_late_ms(&self) -> Option<u16> {
        self.u16_item(b"lt")
    }

    /// `ls` — percent of packets lost, times 100.
    pub fn loss_percent(&self) -> Option<u16> {
        self.u16_item(b"ls")
    }

    /// `dl` — current playout buffer delay, ms.
    pub fn buffer_delay_ms(&self) -> Option<u16> {
        self.u16_item(b"dl")
    }

    /// `:)` — quality is improving (zero-length flag item).
    pub fn is_getting_better(&self) -> bool {
        self.item(b":)").is_some()
    }

    /// `:(` — quality is degrading (zero-length flag item).
    pub fn is_getting_worse(&self) -> bool {
        self.item(b":(").is_some()
    }

    /// `:|` — quality is steady (zero-length flag item).
    pub fn is_steady(&self) -> bool {
        self.item(b":|").is_some()
    }

    /// `ey` — number of simultaneous viewers ("eyes"), reflector fan-out only.
    pub fn eyes(&self) -> Option<u32> {
        self.u32_item(b"ey")
    }

    /// `pr` — total packets received.
    pub fn packets_received(&self) -> Option<u32> {
        self.u32_item(b"pr")
    }

    /// `pd` — packets dropped by the client (buffer overrun).
    pub fn packets_dropped(&self) -> Option<u16> {
        self.u16_item(b"pd")
    }

    /// `pl` — packets lost in transit.
    pub fn packets_lost(&self) -> Option<u16> {
        self.u16_item(b"pl")
    }

    /// `bl` — playout buffer fill, percent.
    pub fn buffer_fill_percent(&self) -> Option<u16> {
        self.u16_item(b"bl")
    }

    /// `fr`/`xr` — instantaneous frame rate, frames/sec.
    pub fn frame_rate(&self) -> Option<u16> {
        self.u16_item(b"fr").or_else(|| self.u16_item(b"xr"))
    }

    /// `d#` — count of dry audio buffer events.
    pub fn audio_dry_count(&self) -> Option<u16> {
        self.u16_item(b"d#")
    }

    /// `ob` — overbuffer window, ms.
    pub fn overbuffer_window_ms(&self) -> Option<u32> {
        self.u32_item(b"ob")
    }
}

/// One 12-byte fixed block inside an `APP(PSS0)`/`NADU` packet:
/// `(SSRC, playout_delay, NSN, reserved+NUN, FBS)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NaduBlock {
    pub ssrc: u32,
    pub playout_delay_ms: u16,
    /// Next sequence number the client expects.
    pub next_sequence_number: u16,
    /// Number of units (packets) the client still needs.
    pub num_units_needed: u16,
    /// Free buffer space available to the client, in bytes (`FBS * 64`).
    pub free_buffer_bytes: u32,
}

/// `APP(PSS0)`/`NADU` — "number and average delay of units" feedback used
/// for adaptive bitrate decisions. One block per stream the client is
/// receiving; at least one, at most ~100.
#[derive(Debug, Clone, PartialEq)]
pub struct NaduAppData {
    pub ssrc: u32,
    pub blocks: Vec<NaduBlock>,
}

const RTCP_SR: u8 = 200;
const RTCP_RR: u8 = 201;
const RTCP_SDES: u8 = 202;
const RTCP_BYE: u8 = 203;
const RTCP_APP: u8 = 204;

const SDES_END: u8 = 0;

/// Parse a compound RTCP packet into its component reports.
///
/// Per RFC 3550 §6.1, a compound packet is a back-to-back sequence of
/// individual RTCP packets with no intervening delimiter; each one's
/// `length` field (in 32-bit words, minus one) gives the next offset.
pub fn parse_compound(buf: &[u8]) -> Vec<RtcpReport> {
    let mut reports = Vec::new();
    let mut offset = 0usize;

    while offset + 4 <= buf.len() {
        let header = &buf[offset..offset + 4];
        let version = header[0] >> 6;
        if version != 2 {
            break;
        }
        let padding = (header[0] & 0x20) != 0;
        let count = header[0] & 0x1F;
        let packet_type = header[1];
        let length_words = u16::from_be_bytes([header[2], header[3]]) as usize;
        let body_len = (length_words + 1) * 4;

        if offset + body_len > buf.len() {
            break;
        }
        let packet = &buf[offset..offset + body_len];
        let mut payload = &packet[4..];
        if padding && !payload.is_empty() {
            let pad_count = *payload.last().unwrap() as usize;
            if pad_count > 0 && pad_count <= payload.len() {
                payload = &payload[..payload.len() - pad_count];
            }
        }

        let report = match packet_type {
            RTCP_SR => parse_sr(payload, count),
            RTCP_RR => parse_rr(payload, count),
            RTCP_SDES => parse_sdes(payload, count),
            RTCP_BYE => parse_bye(payload, count),
            RTCP_APP => parse_app(payload),
            other => RtcpReport::Unknown {
                packet_type: other,
                payload: payload.to_vec(),
            },
        };
        if let Some(report) = report {
            reports.push(report);
        }

        offset += body_len;
    }

    reports
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4).map(|s| u32::from_be_bytes(s.try_into().unwrap()))
}

fn read_report_blocks(buf: &[u8], count: u8) -> Vec<ReportBlock> {
    let mut blocks = Vec::new();
    let mut at = 0usize;
    for _ in 0..count {
        if at + 24 > buf.len() {
            break;
        }
        let source_ssrc = read_u32(buf, at).unwrap();
        let fraction_lost = buf[at + 4];
        let cumulative_lost = u32::from_be_bytes([0, buf[at + 5], buf[at + 6], buf[at + 7]]);
        let highest_sequence = read_u32(buf, at + 8).unwrap();
        let jitter = read_u32(buf, at + 12).unwrap();
        let last_sr = read_u32(buf, at + 16).unwrap();
        let delay_since_last_sr = read_u32(buf, at + 20).unwrap();
        blocks.push(ReportBlock {
            source_ssrc,
            fraction_lost,
            cumulative_lost,
            highest_sequence,
            jitter,
            last_sr,
            delay_since_last_sr,
        });
        at += 24;
    }
    blocks
}

fn parse_sr(buf: &[u8], report_count: u8) -> Option<RtcpReport> {
    if buf.len() < 20 {
        return None;
    }
    let ssrc = read_u32(buf, 0)?;
    let ntp_seconds = read_u32(buf, 4)?;
    let ntp_fraction = read_u32(buf, 8)?;
    let rtp_timestamp = read_u32(buf, 12)?;
    let packet_count = read_u32(buf, 16)?;
    let octet_count = read_u32(buf, 20).unwrap_or(0);
    let report_blocks = read_report_blocks(buf.get(24..).unwrap_or(&[]), report_count);
    Some(RtcpReport::SenderReport(SenderReport {
        ssrc,
        ntp_seconds,
        ntp_fraction,
        rtp_timestamp,
        packet_count,
        octet_count,
        report_blocks,
    }))
}

fn parse_rr(buf: &[u8], report_count: u8) -> Option<RtcpReport> {
    if buf.len() < 4 {
        return None;
    }
    let ssrc = read_u32(buf, 0)?;
    let report_blocks = read_report_blocks(buf.get(4..).unwrap_or(&[]), report_count);
    Some(RtcpReport::ReceiverReport(ReceiverReport { ssrc, report_blocks }))
}

fn parse_sdes(buf: &[u8], chunk_count: u8) -> Option<RtcpReport> {
    let mut chunks = Vec::new();
    let mut at = 0usize;
    for _ in 0..chunk_count {
        if at + 4 > buf.len() {
            break;
        }
        let ssrc = read_u32(buf, at)?;
        at += 4;
        let mut items = Vec::new();
        loop {
            if at >= buf.len() {
                break;
            }
            let item_type = buf[at];
            if item_type == SDES_END {
                at += 1;
                break;
            }
            if at + 2 > buf.len() {
                break;
            }
            let len = buf[at + 1] as usize;
            if at + 2 + len > buf.len() {
                break;
            }
            items.push((item_type, buf[at + 2..at + 2 + len].to_vec()));
            at += 2 + len;
        }
        // SDES chunks are padded to a multiple of 4 bytes.
        at = at.div_ceil(4) * 4;
        chunks.push(SdesChunk { ssrc, items });
    }
    Some(RtcpReport::SourceDescription { chunks })
}

fn parse_bye(buf: &[u8], ssrc_count: u8) -> Option<RtcpReport> {
    let mut ssrcs = Vec::new();
    for i in 0..ssrc_count as usize {
        if let Some(ssrc) = read_u32(buf, i * 4) {
            ssrcs.push(ssrc);
        }
    }
    Some(RtcpReport::Bye { ssrcs })
}

/// Maximum number of blocks accepted in an `APP(PSS0)` packet; a larger
/// count is treated as malformed rather than silently truncated.
const NADU_MAX_BLOCKS: usize = 100;
const NADU_BLOCK_LEN: usize = 12;

fn parse_app(buf: &[u8]) -> Option<RtcpReport> {
    if buf.len() < 8 {
        return None;
    }
    let ssrc = read_u32(buf, 0)?;
    let name = &buf[4..8];
    let data = &buf[8..];

    if name == b"QTSS" {
        return Some(RtcpReport::AppQtss(QtssAppData {
            ssrc,
            items: parse_qtss_items(data),
        }));
    }

    if name == b"PSS0" {
        return parse_nadu_blocks(data).map(|blocks| RtcpReport::AppNadu(NaduAppData { ssrc, blocks }));
    }

    Some(RtcpReport::Unknown {
        packet_type: RTCP_APP,
        payload: buf.to_vec(),
    })
}

/// Walk a sequence of `(name: 2, version: 1, length: 1, value: length)`
/// items until the buffer is exhausted or too short for another header.
fn parse_qtss_items(mut data: &[u8]) -> Vec<QtssItem> {
    let mut items = Vec::new();
    while data.len() >= 4 {
        let name = [data[0], data[1]];
        let version = data[2];
        let len = data[3] as usize;
        data = &data[4..];
        if data.len() < len {
            break;
        }
        let value = data[..len].to_vec();
        data = &data[len..];
        items.push(QtssItem { name, version, value });
    }
    items
}

/// Parse the fixed-width NADU block array. Rejects anything not an exact
/// multiple of 12 bytes, and anything with zero or more than
/// [`NADU_MAX_BLOCKS`] blocks, rather than guessing at a truncated tail.
fn parse_nadu_blocks(data: &[u8]) -> Option<Vec<NaduBlock>> {
    if data.is_empty() || data.len() % NADU_BLOCK_LEN != 0 {
        return None;
    }
    let count = data.len() / NADU_BLOCK_LEN;
    if count == 0 || count > NADU_MAX_BLOCKS {
        return None;
    }

    let mut blocks = Vec::with_capacity(count);
    for i in 0..count {
        let block = &data[i * NADU_BLOCK_LEN..(i + 1) * NADU_BLOCK_LEN];
        let ssrc = read_u32(block, 0)?;
        let playout_delay_ms = u16::from_be_bytes([block[4], block[5]]);
        let next_sequence_number = u16::from_be_bytes([block[6], block[7]]);
        let num_units_needed = u16::from_be_bytes([block[8], block[9]]) & 0x0FFF;
        let fbs = u16::from_be_bytes([block[10], block[11]]);
        blocks.push(NaduBlock {
            ssrc,
            playout_delay_ms,
            next_sequence_number,
            num_units_needed,
            free_buffer_bytes: fbs as u32 * 64,
        });
    }
    Some(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rr_packet(ssrc: u32) -> Vec<u8> {
        let mut buf = vec![0x80, RTCP_RR, 0x00, 0x01];
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf
    }

    #[test]
    fn parses_bare_receiver_report() {
        let reports = parse_compound(&rr_packet(0x1234));
        assert_eq!(reports.len(), 1);
        match &reports[0] {
            RtcpReport::ReceiverReport(rr) => assert_eq!(rr.ssrc, 0x1234),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_sender_report_with_one_block() {
        let mut buf = vec![0x81, RTCP_SR, 0x00, 0x0D];
        buf.extend_from_slice(&1u32.to_be_bytes()); // ssrc
        buf.extend_from_slice(&2u32.to_be_bytes()); // ntp secs
        buf.extend_from_slice(&3u32.to_be_bytes()); // ntp frac
        buf.extend_from_slice(&4u32.to_be_bytes()); // rtp ts
        buf.extend_from_slice(&5u32.to_be_bytes()); // packet count
        buf.extend_from_slice(&6u32.to_be_bytes()); // octet count
        // one report block (24 bytes)
        buf.extend_from_slice(&42u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 20]);

        let reports = parse_compound(&buf);
        assert_eq!(reports.len(), 1);
        match &reports[0] {
            RtcpReport::SenderReport(sr) => {
                assert_eq!(sr.ssrc, 1);
                assert_eq!(sr.packet_count, 5);
                assert_eq!(sr.report_blocks.len(), 1);
                assert_eq!(sr.report_blocks[0].source_ssrc, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_compound_sr_plus_sdes() {
        let mut sr = vec![0x80, RTCP_SR, 0x00, 0x06];
        sr.extend_from_slice(&1u32.to_be_bytes());
        sr.extend_from_slice(&[0u8; 20]);

        let mut sdes = vec![0x81, RTCP_SDES, 0x00, 0x02];
        sdes.extend_from_slice(&1u32.to_be_bytes());
        sdes.push(1); // CNAME
        sdes.push(4);
        sdes.extend_from_slice(b"abcd");
        sdes.push(0); // END
        sdes.push(0); // pad to 4-byte boundary

        let mut compound = sr;
        compound.extend_from_slice(&sdes);

        let reports = parse_compound(&compound);
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0], RtcpReport::SenderReport(_)));
        match &reports[1] {
            RtcpReport::SourceDescription { chunks } => {
                assert_eq!(chunks.len(), 1);
                assert_eq!(chunks[0].items[0], (1u8, b"abcd".to_vec()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_app_qtss_items() {
        let mut item_bytes = Vec::new();
        item_bytes.extend_from_slice(b"rr");
        item_bytes.push(0); // version
        item_bytes.push(4); // length
        item_bytes.extend_from_slice(&500_000u32.to_be_bytes());
        item_bytes.extend_from_slice(b":(");
        item_bytes.push(0);
        item_bytes.push(0); // zero-length flag item

        let mut buf = vec![0x80, RTCP_APP, 0, 0];
        buf.extend_from_slice(&99u32.to_be_bytes());
        buf.extend_from_slice(b"QTSS");
        buf.extend_from_slice(&item_bytes);
        let total_words = (buf.len() / 4) - 1;
        buf[2] = (total_words >> 8) as u8;
        buf[3] = total_words as u8;

        let reports = parse_compound(&buf);
        match &reports[0] {
            RtcpReport::AppQtss(q) => {
                assert_eq!(q.ssrc, 99);
                assert_eq!(q.receiver_bitrate(), Some(500_000));
                assert!(q.is_getting_worse());
                assert!(!q.is_getting_better());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_app_nadu_single_block() {
        let mut block = Vec::new();
        block.extend_from_slice(&1u32.to_be_bytes()); // ssrc
        block.extend_from_slice(&120u16.to_be_bytes()); // playout delay
        block.extend_from_slice(&55u16.to_be_bytes()); // NSN
        block.extend_from_slice(&3u16.to_be_bytes()); // reserved+NUN
        block.extend_from_slice(&10u16.to_be_bytes()); // FBS

        let mut buf = vec![0x80, RTCP_APP, 0, 0];
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(b"PSS0");
        buf.extend_from_slice(&block);
        let total_words = (buf.len() / 4) - 1;
        buf[2] = (total_words >> 8) as u8;
        buf[3] = total_words as u8;

        let reports = parse_compound(&buf);
        match &reports[0] {
            RtcpReport::AppNadu(n) => {
                assert_eq!(n.ssrc, 7);
                assert_eq!(n.blocks.len(), 1);
                assert_eq!(n.blocks[0].next_sequence_number, 55);
                assert_eq!(n.blocks[0].num_units_needed, 3);
                assert_eq!(n.blocks[0].free_buffer_bytes, 640);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nadu_block_count_not_multiple_of_twelve_is_rejected() {
        let mut buf = vec![0x80, RTCP_APP, 0, 0];
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(b"PSS0");
        buf.extend_from_slice(&[0u8; 8]); // not a multiple of 12, but word-aligned
        let total_words = (buf.len() / 4) - 1;
        buf[2] = (total_words >> 8) as u8;
        buf[3] = total_words as u8;

        let reports = parse_compound(&buf);
        assert!(matches!(reports[0], RtcpReport::Unknown { .. }));
    }

    #[test]
    fn truncated_packet_is_dropped_not_panicking() {
        let reports = parse_compound(&[0x80, RTCP_RR, 0xFF, 0xFF, 1, 2, 3]);
        assert!(reports.is_empty());
    }

    #[test]
    fn bye_with_two_ssrcs() {
        let mut buf = vec![0x82, RTCP_BYE, 0x00, 0x02];
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&2u32.to_be_bytes());
        let reports = parse_compound(&buf);
        match &reports[0] {
            RtcpReport::Bye { ssrcs } => assert_eq!(ssrcs, &vec![1, 2]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
