//! Server-wide configuration (SPEC_FULL.md §4.17).
//!
//! Parsed once at process start by the CLI binary (or a host application)
//! and handed down as an `Arc<ServerConfig>`; nothing below this boundary
//! re-reads environment or argv. `core` itself depends on no CLI-parsing
//! crate — the `cli` crate owns `clap` and converts its `Args` into this
//! type at the boundary.

use std::collections::HashMap;
use std::ops::RangeInclusive;

/// Lower bound of the UDP port range RTP/RTCP socket pairs are allocated
/// from (SPEC_FULL.md §4.4). Preserved as a wire contract.
pub const UDP_PORT_RANGE_MIN: u16 = 6970;
/// Upper bound of the UDP port range (inclusive).
pub const UDP_PORT_RANGE_MAX: u16 = 65535;

/// Default RTSP session idle timeout, in seconds (SPEC_FULL.md §3).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 120;

/// Default Digest authentication realm.
pub const DEFAULT_DIGEST_REALM: &str = "Streaming Server";

/// Maximum request line + headers size before the parser rejects with 400
/// and closes the connection (SPEC_FULL.md §4.6).
pub const MAX_REQUEST_HEADER_BYTES: usize = 4096;

/// Server-level configuration shared by every protocol/transport component.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=`/`c=` lines. When `None`, the host
    /// is inferred from the request URI or client address.
    pub public_host: Option<String>,
    /// Public RTSP port for URL-based headers (e.g. `RTP-Info`).
    pub public_port: Option<u16>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field.
    pub sdp_session_id: String,
    /// SDP origin session version field.
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Idle-timeout applied to sessions with no client-requested override.
    pub rtsp_session_timeout_secs: u64,
    /// Inclusive range UDP RTP/RTCP socket pairs are allocated from.
    pub udp_port_range: RangeInclusive<u16>,
    /// Worker thread count for periodic housekeeping tasks (C2). Defaults
    /// to the detected CPU count.
    pub worker_threads: usize,
    /// Digest authentication realm presented in `WWW-Authenticate` challenges.
    pub digest_realm: String,
    /// When `true`, bypasses the reflector's destination-reachability check
    /// (`IsReflectableIPAddr` in the original). Off by default; every
    /// bypass this causes is logged. See DESIGN.md Open Question #1.
    pub reflectable_override: bool,
    /// Credential store for Digest/Basic auth, keyed by username, value is
    /// the plaintext password. Empty means no credentials are configured.
    pub credentials: HashMap<String, String>,
    /// RTSP methods that require authentication when `credentials` is
    /// non-empty. ANNOUNCE/RECORD (publishing) are the common case; DESCRIBE
    /// and SETUP/PLAY can be added for fully gated deployments.
    pub protected_methods: Vec<String>,
    /// Maximum size, in bytes, of the request line + headers before the
    /// parser rejects the request with 400 and closes the connection
    /// (SPEC_FULL.md §4.6 wire contract).
    pub max_request_header_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            public_port: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            rtsp_session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            udp_port_range: UDP_PORT_RANGE_MIN..=UDP_PORT_RANGE_MAX,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            digest_realm: DEFAULT_DIGEST_REALM.to_string(),
            reflectable_override: false,
            credentials: HashMap::new(),
            protected_methods: vec!["ANNOUNCE".to_string(), "RECORD".to_string()],
            max_request_header_bytes: MAX_REQUEST_HEADER_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ServerConfig::default();
        assert_eq!(config.rtsp_session_timeout_secs, 120);
        assert_eq!(*config.udp_port_range.start(), 6970);
        assert_eq!(*config.udp_port_range.end(), 65535);
        assert_eq!(config.digest_realm, "Streaming Server");
        assert!(!config.reflectable_override);
        assert!(config.worker_threads >= 1);
        assert_eq!(config.max_request_header_bytes, 4096);
        assert!(config.credentials.is_empty());
        assert!(config.protected_methods.contains(&"ANNOUNCE".to_string()));
    }
}
