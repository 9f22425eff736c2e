//! RTP meta-info packet parsing (SPEC_FULL.md §4.11).
//!
//! `x-RTP-Meta-Info` lets a client ask for a handful of extra fields
//! prepended to each RTP payload: packet position (`pp`), transmit time
//! (`tt`), frame type (`ft`), packet number (`pn`), sequence number (`sq`),
//! and a terminal `md` marker after which the ordinary RTP media bytes
//! follow untouched. No `original_source/` file covers this extension
//! directly (it has no counterpart outside the QTSS-lineage SETUP
//! negotiation); the field/TLV layout below follows spec.md §4.11 exactly.

/// The six recognised two-character field names, in the order spec.md
/// lists them.
pub const FIELD_NAMES: [&str; 6] = ["pp", "tt", "ft", "pn", "sq", "md"];

/// One field negotiated in an `x-RTP-Meta-Info` header, optionally bound
/// to a compressed single-byte ID for this peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedField {
    pub name: [u8; 2],
    /// `Some(id)` when the client/server agreed to a compressed 1-byte ID
    /// (`id` always `< 0x80`; the high bit is set on the wire to flag it).
    pub compressed_id: Option<u8>,
}

/// Parse an `x-RTP-Meta-Info` header value into its negotiated field list.
///
/// Format: semicolon-or-comma-separated tokens, each either a bare
/// two-character field name (`pp`) or a name bound to a per-peer
/// compressed ID (`pp=3`).
pub fn parse_header(value: &str) -> Vec<NegotiatedField> {
    value
        .split([';', ','])
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .filter_map(|tok| {
            let mut parts = tok.splitn(2, '=');
            let name = parts.next()?.trim();
            if name.len() != 2 {
                return None;
            }
            let mut name_bytes = [0u8; 2];
            name_bytes.copy_from_slice(name.as_bytes());
            let compressed_id = parts
                .next()
                .and_then(|id| id.trim().parse::<u8>().ok())
                .map(|id| id & 0x7F);
            Some(NegotiatedField {
                name: name_bytes,
                compressed_id,
            })
        })
        .collect()
}

/// A single decoded field from the TLV-encoded meta-info prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaInfoValue {
    pub name: [u8; 2],
    pub value: Vec<u8>,
}

/// A parsed meta-info-prefixed RTP payload: the decoded field values and
/// the plain RTP media bytes that follow the `md` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMetaInfoPacket {
    pub fields: Vec<MetaInfoValue>,
    pub media: Vec<u8>,
}

impl RtpMetaInfoPacket {
    /// Look up a decoded field's raw value by its two-character name.
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        let name = name.as_bytes();
        if name.len() != 2 {
            return None;
        }
        self.fields
            .iter()
            .find(|f| f.name[0] == name[0] && f.name[1] == name[1])
            .map(|f| f.value.as_slice())
    }
}

/// Parse a meta-info-prefixed RTP payload into its fields and trailing
/// media bytes.
///
/// Each record is a 2-byte name tag followed by a length field: 1 byte
/// when the high bit of the tag's first byte is set (compressed
/// per-peer ID form — the ID is the tag's second byte, first byte cleared
/// of its high bit is ignored padding), 2 bytes otherwise (plain ASCII
/// name). The `md` record carries no length of its own: everything after
/// its 2-byte tag is the RTP media payload, and parsing stops there.
pub fn parse_payload(buf: &[u8]) -> Option<RtpMetaInfoPacket> {
    let mut fields = Vec::new();
    let mut offset = 0usize;

    loop {
        if offset + 2 > buf.len() {
            return Some(RtpMetaInfoPacket {
                fields,
                media: Vec::new(),
            });
        }
        let tag = [buf[offset], buf[offset + 1]];
        let compressed = tag[0] & 0x80 != 0;
        let name = if compressed {
            [tag[0] & 0x7F, tag[1]]
        } else {
            tag
        };
        offset += 2;

        if &name == b"md" {
            let media = buf.get(offset..).unwrap_or(&[]).to_vec();
            return Some(RtpMetaInfoPacket { fields, media });
        }

        let len = if compressed {
            let len = *buf.get(offset)? as usize;
            offset += 1;
            len
        } else {
            let len_bytes = buf.get(offset..offset + 2)?;
            let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            offset += 2;
            len
        };

        let value = buf.get(offset..offset + len)?.to_vec();
        offset += len;
        fields.push(MetaInfoValue { name, value });
    }
}

/// Rewrite a meta-info-prefixed packet in place to a plain RTP datagram:
/// drop the decoded field TLVs and splice the original 12-byte RTP header
/// directly against the media bytes.
pub fn to_rtp(rtp_header: &[u8; 12], packet: &RtpMetaInfoPacket) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + packet.media.len());
    out.extend_from_slice(rtp_header);
    out.extend_from_slice(&packet.media);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_with_bare_and_compressed_fields() {
        let fields = parse_header("pp;tt=3;ft,sq=12");
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].name, *b"pp");
        assert_eq!(fields[0].compressed_id, None);
        assert_eq!(fields[1].name, *b"tt");
        assert_eq!(fields[1].compressed_id, Some(3));
    }

    #[test]
    fn parses_uncompressed_field_then_media() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"sq");
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x07]);
        buf.extend_from_slice(b"md");
        buf.extend_from_slice(b"PAYLOAD");

        let parsed = parse_payload(&buf).unwrap();
        assert_eq!(parsed.field("sq"), Some(&[0x00, 0x07][..]));
        assert_eq!(parsed.media, b"PAYLOAD");
    }

    #[test]
    fn parses_compressed_field() {
        let mut buf = Vec::new();
        // compressed tag: high bit set on 'p', second byte is the 1-byte id (3)
        buf.push(b'p' | 0x80);
        buf.push(3);
        buf.push(1); // length = 1
        buf.push(9); // value
        buf.extend_from_slice(b"md");
        buf.extend_from_slice(b"X");

        let parsed = parse_payload(&buf).unwrap();
        assert_eq!(parsed.fields.len(), 1);
        assert_eq!(parsed.fields[0].value, vec![9]);
        assert_eq!(parsed.media, b"X");
    }

    #[test]
    fn to_rtp_splices_header_against_media() {
        let header = [0xAAu8; 12];
        let packet = RtpMetaInfoPacket {
            fields: vec![MetaInfoValue {
                name: *b"sq",
                value: vec![0, 1],
            }],
            media: vec![1, 2, 3],
        };
        let rewritten = to_rtp(&header, &packet);
        assert_eq!(&rewritten[..12], &header);
        assert_eq!(&rewritten[12..], &[1, 2, 3]);
    }

    #[test]
    fn truncated_payload_without_md_returns_empty_media() {
        let parsed = parse_payload(b"").unwrap();
        assert!(parsed.fields.is_empty());
        assert!(parsed.media.is_empty());
    }
}
