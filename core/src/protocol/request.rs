use crate::error::{ParseErrorKind, RtspError};

/// RTSP method names (RFC 2326 §10; ANNOUNCE/RECORD per §10.10/§10.11,
/// REDIRECT per §10.9). Unrecognized methods parse to [`Method::Other`]
/// and are rejected by the handler with `501 Not Implemented`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    Record,
    Announce,
    SetParameter,
    GetParameter,
    Redirect,
    Other(String),
}

impl Method {
    /// Method names are case-sensitive (SPEC_FULL.md §4.6).
    fn parse(raw: &str) -> Self {
        match raw {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "RECORD" => Method::Record,
            "ANNOUNCE" => Method::Announce,
            "SET_PARAMETER" => Method::SetParameter,
            "GET_PARAMETER" => Method::GetParameter,
            "REDIRECT" => Method::Redirect,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::Record => "RECORD",
            Method::Announce => "ANNOUNCE",
            Method::SetParameter => "SET_PARAMETER",
            Method::GetParameter => "GET_PARAMETER",
            Method::Redirect => "REDIRECT",
            Method::Other(s) => s,
        }
    }
}

/// Parsed `Authorization` header (RFC 2617).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Basic {
        token: String,
    },
    Digest {
        username: String,
        realm: String,
        nonce: String,
        uri: String,
        qop: Option<String>,
        nc: Option<String>,
        cnonce: Option<String>,
        response: String,
        opaque: Option<String>,
    },
}

impl Authorization {
    fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        if let Some(token) = header.strip_prefix("Basic ") {
            return Some(Authorization::Basic {
                token: token.trim().to_string(),
            });
        }
        let rest = header.strip_prefix("Digest ")?;

        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut qop = None;
        let mut nc = None;
        let mut cnonce = None;
        let mut response = None;
        let mut opaque = None;

        for field in split_digest_fields(rest) {
            let (key, value) = field.split_once('=')?;
            let key = key.trim();
            let value = value.trim().trim_matches('"').to_string();
            match key {
                "username" => username = Some(value),
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "uri" => uri = Some(value),
                "qop" => qop = Some(value),
                "nc" => nc = Some(value),
                "cnonce" => cnonce = Some(value),
                "response" => response = Some(value),
                "opaque" => opaque = Some(value),
                _ => {}
            }
        }

        Some(Authorization::Digest {
            username: username?,
            realm: realm?,
            nonce: nonce?,
            uri: uri?,
            qop,
            nc,
            cnonce,
            response: response?,
            opaque,
        })
    }
}

/// Split a Digest `Authorization` header's comma-separated `key=value`
/// fields, respecting commas embedded inside quoted values.
fn split_digest_fields(rest: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in rest.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(rest[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(rest[start..].trim());
    fields.into_iter().filter(|f| !f.is_empty()).collect()
}

/// Parsed `Session` header value: `<id>[;timeout=N]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    pub timeout_secs: Option<u64>,
}

impl SessionHeader {
    fn parse(header: &str) -> Self {
        let mut parts = header.split(';');
        let id = parts.next().unwrap_or("").trim().to_string();
        let mut timeout_secs = None;
        for part in parts {
            if let Some(value) = part.trim().strip_prefix("timeout=") {
                timeout_secs = value.parse::<u64>().ok();
            }
        }
        SessionHeader { id, timeout_secs }
    }
}

/// Parsed `Range: npt=<start>[-<stop>]` header (floating-point seconds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NptRange {
    pub start_secs: f64,
    pub stop_secs: Option<f64>,
}

impl NptRange {
    fn parse(header: &str) -> Option<Self> {
        let npt = header.trim().strip_prefix("npt=")?;
        let (start, stop) = match npt.split_once('-') {
            Some((s, e)) if !e.is_empty() => (s, Some(e)),
            Some((s, _)) => (s, None),
            None => (npt, None),
        };
        Some(NptRange {
            start_secs: start.trim().parse().ok()?,
            stop_secs: stop.and_then(|s| s.trim().parse().ok()),
        })
    }
}

/// Parsed `x-Retransmit: our-retransmit;window=<N>` header (SPEC_FULL.md
/// §4.6) — requests reliable UDP and sets the per-stream ack window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest {
    pub window_bytes: Option<u32>,
}

impl RetransmitRequest {
    fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let scheme = parts.next()?.trim();
        if scheme != "our-retransmit" {
            return None;
        }
        let mut window_bytes = None;
        for part in parts {
            if let Some(value) = part.trim().strip_prefix("window=") {
                window_bytes = value.parse::<u32>().ok();
            }
        }
        Some(RetransmitRequest { window_bytes })
    }
}

/// An opaque framed interleaved data packet (RFC 2326 §10.12): `'$'` +
/// channel byte + 16-bit big-endian length + payload. Detected ahead of
/// RTSP message parsing whenever the connection carries RTP-over-TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

impl InterleavedFrame {
    /// `'$'` marker byte per RFC 2326 §10.12.
    pub const MARKER: u8 = b'$';

    /// Try to pull one complete interleaved frame off the front of `buf`.
    ///
    /// Returns `Some((frame, consumed_bytes))` when a full frame is
    /// present, `None` when more bytes are needed (or `buf` doesn't start
    /// with the `$` marker at all).
    pub fn try_parse(buf: &[u8]) -> Option<(InterleavedFrame, usize)> {
        if buf.first() != Some(&Self::MARKER) || buf.len() < 4 {
            return None;
        }
        let channel = buf[1];
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + length {
            return None;
        }
        let payload = buf[4..4 + length].to_vec();
        Some((InterleavedFrame { channel, payload }, 4 + length))
    }

    /// Serialize to wire bytes: `$` + channel + length + payload.
    pub fn encode(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + payload.len());
        out.push(Self::MARKER);
        out.push(channel);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. Continuation
/// lines (leading SP/TAB) are folded into the previous header's value
/// before parsing reaches this type — see
/// [`fold_continuations`](Self::fold_continuations).
#[derive(Debug)]
pub struct RtspRequest {
    pub method: Method,
    /// Request-URI as received: absolute (`rtsp://host[:port]/path[?query]`),
    /// path-only, or `*` (OPTIONS only).
    pub uri: String,
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Request body (ANNOUNCE's SDP description, SET_PARAMETER's payload),
    /// read separately by the transport layer once `Content-Length` is known.
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Fold RFC 2326 §4.1 continuation lines (a line starting with SP or
    /// TAB extends the previous header's value) before per-line parsing.
    fn fold_continuations(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        for line in raw.split("\r\n") {
            if (line.starts_with(' ') || line.starts_with('\t')) && !out.is_empty() {
                out.push(' ');
                out.push_str(line.trim_start());
            } else {
                if !out.is_empty() {
                    out.push_str("\r\n");
                }
                out.push_str(line);
            }
        }
        out
    }

    /// Parse an RTSP request's header block (request line + headers, no
    /// body). Returns [`RtspError::Parse`] on malformed input per
    /// SPEC_FULL.md §4.6. The caller is responsible for separately reading
    /// `Content-Length` body bytes, if any, and assigning them to `body`.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let folded = Self::fold_continuations(raw);
        let mut lines = folded.lines();

        let request_line = lines.next().ok_or(RtspError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();

        if parts.len() != 3 {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = Method::parse(parts[0]);
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if uri != "*" && method != Method::Options && uri.is_empty() {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();

        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            headers.push((name, value));
        }

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body: Vec::new(),
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    pub fn session(&self) -> Option<SessionHeader> {
        self.get_header("Session").map(SessionHeader::parse)
    }

    pub fn range(&self) -> Option<NptRange> {
        self.get_header("Range").and_then(NptRange::parse)
    }

    pub fn authorization(&self) -> Option<Authorization> {
        self.get_header("Authorization").and_then(Authorization::parse)
    }

    pub fn retransmit_request(&self) -> Option<RetransmitRequest> {
        self.get_header("x-Retransmit").and_then(RetransmitRequest::parse)
    }

    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0)
    }

    pub fn bandwidth_bps(&self) -> Option<u64> {
        self.get_header("Bandwidth").and_then(|v| v.trim().parse().ok())
    }

    pub fn speed(&self) -> Option<f64> {
        self.get_header("Speed").and_then(|v| v.trim().parse().ok())
    }

    /// Absolute (`rtsp://host[:port]/path`) vs. path-only URI.
    pub fn is_absolute_uri(&self) -> bool {
        self.uri.starts_with("rtsp://") || self.uri.starts_with("rtsps://")
    }
}
