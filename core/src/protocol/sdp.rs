//! SDP (Session Description Protocol) generation and parsing (RFC 4566 / RFC 2327).
//!
//! Two directions:
//!
//! - [`generate_sdp`]: produces the SDP body returned by DESCRIBE responses
//!   for a locally-held [`Mount`].
//! - [`parse_source_info`]/[`canonicalize`] (SPEC_FULL.md §4.13): parses an
//!   incoming SDP (from ANNOUNCE, or fetched for a relayed source) into a
//!   [`SourceInfo`] the reflector can bind sockets from, and rewrites it
//!   into the canonical form handed back to players. Grounded in
//!   `original_source/CommonUtilitiesLib/SDPUtils.cpp`'s line-class
//!   validation, sort order, and per-track `a=control` assignment.

use crate::error::RtspError;
use crate::mount::Mount;
use std::net::IpAddr;

/// Generate an SDP session description for the given mount.
///
/// When multi-track (audio+video) support is added, this will iterate
/// over the mount's tracks to produce multiple `m=` lines.
pub fn generate_sdp(
    mount: &Mount,
    ip: &str,
    session_id: &str,
    session_version: &str,
    username: &str,
    session_name: &str,
) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        username, session_id, session_version, ip
    ));
    sdp.push(format!("s={}", session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-rs".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", mount.payload_type()));
    sdp.extend_from_slice(&mount.sdp_attributes()[0..]);

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

/// Media kind derived from an `m=` line's media field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Other,
}

/// Session-level broadcast control mode (`a=x-broadcastcontrol`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastControlMode {
    #[default]
    Rtsp,
    Time,
}

/// One `m=` media section parsed out of an incoming SDP.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub kind: MediaKind,
    pub payload_type: u8,
    pub payload_name: Option<String>,
    pub is_tcp: bool,
    pub track_id: u32,
    pub destination: Option<IpAddr>,
    pub ttl: Option<u8>,
}

/// Parsed view over an incoming SDP, sufficient to bind reflector sockets
/// and answer SETUP/PLAY without re-parsing raw text (SPEC_FULL.md §4.13).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceInfo {
    pub streams: Vec<StreamInfo>,
    pub global_destination: Option<IpAddr>,
    pub global_ttl: Option<u8>,
    pub buffer_delay_secs: f32,
    pub broadcast_control: BroadcastControlMode,
    pub active_start_ntp: Option<u64>,
    pub active_stop_ntp: Option<u64>,
}

const DEFAULT_BUFFER_DELAY_SECS: f32 = 3.0;
const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Valid leading characters for an SDP line (RFC 2327 session/media-level
/// type letters this crate recognizes), in the canonical session-level
/// sort order used by [`canonicalize`].
const SESSION_LINE_ORDER: &[u8] = b"vosiuepcbtrzka";

fn validate_lines(sdp: &str) -> crate::error::Result<()> {
    for line in sdp.lines() {
        if line.is_empty() {
            continue;
        }
        let mut chars = line.chars();
        let first = chars.next().unwrap();
        if !SESSION_LINE_ORDER.contains(&(first as u8)) && first != 'm' {
            return Err(RtspError::BadRequest(format!(
                "invalid SDP line: {line}"
            )));
        }
        match chars.next() {
            Some('=') => {}
            _ => {
                return Err(RtspError::BadRequest(format!(
                    "invalid SDP line: {line}"
                )));
            }
        }
        if line.chars().nth(2) == Some(' ') && matches!(first, 'v' | 'o' | 's' | 't' | 'm') {
            // whitespace immediately after '=' on lines where it's never valid
            return Err(RtspError::BadRequest(format!(
                "invalid SDP line: {line}"
            )));
        }
    }
    Ok(())
}

/// Parse an incoming SDP body into a [`SourceInfo`].
pub fn parse_source_info(sdp: &str) -> crate::error::Result<SourceInfo> {
    validate_lines(sdp)?;

    let mut info = SourceInfo {
        buffer_delay_secs: DEFAULT_BUFFER_DELAY_SECS,
        ..Default::default()
    };
    let mut next_track_id = 1u32;

    for line in sdp.lines() {
        if line.len() < 2 {
            continue;
        }
        let (kind_char, rest) = (line.as_bytes()[0] as char, &line[2..]);

        match kind_char {
            'm' => {
                let mut parts = rest.split_whitespace();
                let media = parts.next().unwrap_or("");
                let _port = parts.next();
                let transport = parts.next().unwrap_or("");
                let pt = parts
                    .next()
                    .and_then(|p| p.parse::<u8>().ok())
                    .unwrap_or(0);

                let kind = match media {
                    "audio" => MediaKind::Audio,
                    "video" => MediaKind::Video,
                    _ => MediaKind::Other,
                };
                let is_tcp = transport.contains("TCP");

                info.streams.push(StreamInfo {
                    kind,
                    payload_type: pt,
                    payload_name: None,
                    is_tcp,
                    track_id: next_track_id,
                    destination: None,
                    ttl: None,
                });
                next_track_id += 1;
            }
            'c' => {
                // c=IN IP4 <addr>[/ttl]
                let mut parts = rest.split_whitespace();
                let _net_type = parts.next();
                let _addr_type = parts.next();
                let Some(addr_field) = parts.next() else {
                    continue;
                };
                let (addr_str, ttl) = match addr_field.split_once('/') {
                    Some((addr, ttl)) => (addr, ttl.parse::<u8>().ok()),
                    None => (addr_field, None),
                };
                let Ok(addr) = addr_str.parse::<IpAddr>() else {
                    continue;
                };

                if let Some(last) = info.streams.last_mut() {
                    last.destination = Some(addr);
                    last.ttl = ttl;
                } else {
                    info.global_destination = Some(addr);
                    info.global_ttl = ttl;
                }
            }
            'a' => {
                if let Some(rtpmap) = rest.strip_prefix("rtpmap:") {
                    let mut parts = rtpmap.split_whitespace();
                    let pt = parts.next().and_then(|p| p.parse::<u8>().ok());
                    let name = parts.next().map(|s| s.split('/').next().unwrap_or(s).to_string());
                    if let (Some(pt), Some(name)) = (pt, name) {
                        if let Some(stream) = info.streams.iter_mut().find(|s| s.payload_type == pt) {
                            stream.payload_name = Some(name);
                        }
                    }
                } else if let Some(control) = rest.strip_prefix("control:") {
                    if let Some(track_str) = control.strip_prefix("trackID=") {
                        if let Ok(track_id) = track_str.parse::<u32>() {
                            if let Some(stream) = info.streams.last_mut() {
                                stream.track_id = track_id;
                            }
                        }
                    }
                } else if let Some(delay) = rest.strip_prefix("x-bufferdelay:") {
                    if let Ok(delay) = delay.trim().parse::<f32>() {
                        info.buffer_delay_secs = delay;
                    }
                } else if let Some(mode) = rest.strip_prefix("x-broadcastcontrol:") {
                    info.broadcast_control = match mode.trim() {
                        "TIME" => BroadcastControlMode::Time,
                        _ => BroadcastControlMode::Rtsp,
                    };
                }
            }
            't' => {
                let mut parts = rest.split_whitespace();
                let start = parts.next().and_then(|p| p.parse::<u64>().ok());
                let stop = parts.next().and_then(|p| p.parse::<u64>().ok());
                if let (Some(start), Some(stop)) = (start, stop) {
                    if stop != 0 && start != 0 && stop < start {
                        return Err(RtspError::BadRequest(
                        "SDP t= line: stop time precedes start time".to_string(),
                    ));
                    }
                    // start < NTP epoch silently means "always active" (not rejected).
                    let _ = NTP_UNIX_EPOCH_OFFSET;
                    info.active_start_ntp = Some(start);
                    info.active_stop_ntp = Some(stop);
                }
            }
            _ => {}
        }
    }

    Ok(info)
}

/// Rewrite an incoming SDP into the canonical form handed back to players:
/// strips `c=` lines, strips ports from `m=` lines, injects a global
/// `c=IN IP4 0.0.0.0` and session-level `a=control:*` before the first
/// `m=`, assigns `a=control:trackID=<i>` per track where missing, then
/// sorts session-level lines into `v o s i u e p c b t r z k a` order
/// (keeping the first of any single-instance line) before appending the
/// media sections verbatim.
pub fn canonicalize(sdp: &str) -> crate::error::Result<String> {
    validate_lines(sdp)?;

    let mut session_lines: Vec<(u8, String)> = Vec::new();
    let mut session_seen: std::collections::HashSet<u8> = std::collections::HashSet::new();
    let mut media_blocks: Vec<Vec<String>> = Vec::new();
    let mut in_media = false;
    let mut track_counter = 0u32;

    for line in sdp.lines() {
        if line.is_empty() {
            continue;
        }
        let kind = line.as_bytes()[0];

        if kind == b'm' {
            in_media = true;
            track_counter += 1;
            let mut parts = line[2..].split_whitespace();
            let media = parts.next().unwrap_or("");
            let _port = parts.next();
            let rest: Vec<&str> = parts.collect();
            let rewritten = format!("m={} 0 {}", media, rest.join(" "));
            media_blocks.push(vec![rewritten]);
            continue;
        }

        if kind == b'c' {
            // Dropped; a canonical c= line is injected globally below.
            continue;
        }

        if in_media {
            let block = media_blocks.last_mut().unwrap();
            block.push(line.to_string());
            continue;
        }

        if SESSION_LINE_ORDER.contains(&kind) {
            if session_seen.insert(kind) || kind == b'a' {
                session_lines.push((kind, line.to_string()));
            }
        }
    }

    // Ensure each media block has an a=control:trackID=<i> if missing.
    for (i, block) in media_blocks.iter_mut().enumerate() {
        let has_control = block.iter().any(|l| l.starts_with("a=control:"));
        if !has_control {
            block.push(format!("a=control:trackID={}", i + 1));
        }
    }
    let _ = track_counter;

    // Inject the canonical c= and session-level a=control before the
    // first m= line: represented here as ordinary session lines so the
    // sort below places them correctly (c before a).
    session_lines.push((b'c', "c=IN IP4 0.0.0.0".to_string()));
    session_lines.push((b'a', "a=control:*".to_string()));

    let rank = |kind: u8| SESSION_LINE_ORDER.iter().position(|&k| k == kind).unwrap_or(usize::MAX);
    session_lines.sort_by_key(|(kind, _)| rank(*kind));

    let mut out: Vec<String> = session_lines.into_iter().map(|(_, line)| line).collect();
    for block in media_blocks {
        out.extend(block);
    }

    Ok(format!("{}\r\n", out.join("\r\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;

    #[test]
    fn generates_h264_sdp() {
        let mount = Mount::new("/stream", Box::new(H264Packetizer::new(96, 0x12345678)));
        let sdp = generate_sdp(
            &mount,
            "192.168.1.100",
            "1234567890",
            "1",
            "server",
            "Test Session",
        );
        assert!(sdp.contains("v=0\r\n"));
        assert!(sdp.contains("o=server 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Test Session\r\n"));
        assert!(
            sdp.contains("c=IN IP4 192.168.1.100\r\n"),
            "c= must use configured IP, not 0.0.0.0"
        );
        assert!(
            sdp.contains("a=tool:rtsp-rs\r\n"),
            "SDP must include tool attribute"
        );
        assert!(
            sdp.contains("a=sendonly\r\n"),
            "SDP must include sendonly direction"
        );
        assert!(
            sdp.contains("a=rtpmap:96 H264/90000\r\n"),
            "SDP must include valid rtpmap"
        );
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1\r\n"));
        assert!(sdp.contains("a=control:track1\r\n"));

        let rtpmap_idx = sdp.find("a=rtpmap").expect("SDP must include rtpmap");
        let fmtp_idx = sdp.find("a=fmtp").expect("SDP must include fmtp");
        assert!(rtpmap_idx < fmtp_idx);

        let sendonly_idx = sdp.find("a=sendonly").expect("SDP must include sendonly");
        let m_idx = sdp.find("m=video").expect("SDP must include media section");
        assert!(sendonly_idx < m_idx);

        assert!(fmtp_idx > m_idx);
        assert!(sdp.ends_with("\r\n"));
    }

    const SAMPLE_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 10.0.0.1\r\n\
s=Example\r\n\
t=0 0\r\n\
m=video 5004 RTP/AVP 96\r\n\
c=IN IP4 239.1.1.1/16\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:trackID=1\r\n\
m=audio 5006 RTP/AVP 97\r\n\
a=rtpmap:97 MPEG4-GENERIC/48000\r\n";

    #[test]
    fn parses_source_info_streams_and_destination() {
        let info = parse_source_info(SAMPLE_SDP).unwrap();
        assert_eq!(info.streams.len(), 2);
        assert_eq!(info.streams[0].kind, MediaKind::Video);
        assert_eq!(info.streams[0].payload_type, 96);
        assert_eq!(info.streams[0].payload_name.as_deref(), Some("H264"));
        assert_eq!(info.streams[0].track_id, 1);
        assert!(info.streams[0].destination.is_some());
        assert_eq!(info.streams[0].ttl, Some(16));

        assert_eq!(info.streams[1].track_id, 2);
    }

    #[test]
    fn rejects_invalid_leading_character() {
        assert!(parse_source_info("x=bogus\r\n").is_err());
    }

    #[test]
    fn rejects_timing_with_stop_before_start() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 10.0.0.1\r\ns=E\r\nt=200 100\r\nm=video 0 RTP/AVP 96\r\n";
        assert!(parse_source_info(sdp).is_err());
    }

    #[test]
    fn canonicalize_strips_ports_and_injects_control() {
        let canon = canonicalize(SAMPLE_SDP).unwrap();
        assert!(canon.contains("m=video 0 RTP/AVP 96"));
        assert!(canon.contains("m=audio 0 RTP/AVP 97"));
        assert!(!canon.contains("c=IN IP4 239.1.1.1"));
        assert!(canon.contains("c=IN IP4 0.0.0.0"));
        assert!(canon.contains("a=control:*"));
        assert!(canon.contains("a=control:trackID=2"));
    }

    #[test]
    fn canonicalize_sorts_session_lines() {
        let canon = canonicalize(SAMPLE_SDP).unwrap();
        let v_idx = canon.find("v=0").unwrap();
        let o_idx = canon.find("o=").unwrap();
        let s_idx = canon.find("s=").unwrap();
        let t_idx = canon.find("t=").unwrap();
        let m_idx = canon.find("m=video").unwrap();
        assert!(v_idx < o_idx);
        assert!(o_idx < s_idx);
        assert!(s_idx < t_idx);
        assert!(t_idx < m_idx);
    }

    #[test]
    fn buffer_delay_defaults_when_absent() {
        let info = parse_source_info(SAMPLE_SDP).unwrap();
        assert_eq!(info.buffer_delay_secs, 3.0);
    }

    #[test]
    fn buffer_delay_parsed_when_present() {
        let sdp = format!("{}a=x-bufferdelay:1.5\r\n", SAMPLE_SDP);
        let info = parse_source_info(&sdp).unwrap();
        assert_eq!(info.buffer_delay_secs, 1.5);
    }
}
