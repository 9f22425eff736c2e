use crate::mount::{self, MountRegistry};
use crate::net::udp_pool::UdpSocketPool;
use crate::protocol::request::{Authorization, Method};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::reflector::{Output, ReflectorRegistry};
use crate::server::ServerConfig;
use crate::session::auth::AuthState;
use crate::session::transport::{TransportHeader, TransportMode};
use crate::session::{SessionManager, SessionState, Transport};
use crate::timeout::TimeoutTask;
use std::net::SocketAddr;
use std::sync::Arc;

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    session_manager: SessionManager,
    mounts: MountRegistry,
    client_addr: SocketAddr,
    config: Arc<ServerConfig>,
    reflectors: Arc<ReflectorRegistry>,
    timeout_task: TimeoutTask,
    udp_pool: Arc<UdpSocketPool>,
    /// Digest/Basic challenge state for requests sent ahead of any session
    /// existing, e.g. ANNOUNCE (RFC 2326 §10.10 precedes SETUP/RECORD).
    connection_auth: AuthState,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
}

impl MethodHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_manager: SessionManager,
        client_addr: SocketAddr,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
        reflectors: Arc<ReflectorRegistry>,
        timeout_task: TimeoutTask,
        udp_pool: Arc<UdpSocketPool>,
    ) -> Self {
        MethodHandler {
            session_manager,
            mounts,
            client_addr,
            config,
            reflectors,
            timeout_task,
            udp_pool,
            connection_auth: AuthState::new(),
            session_ids: Vec::new(),
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0").to_string();
        let cseq = cseq.as_str();
        let method_str = request.method.as_str();

        if let Some(session_id) = self.extract_session_id(request) {
            if let Some(session) = self.session_manager.get_session(&session_id) {
                self.timeout_task.refresh(&session_id, session.timeout_secs * 1000);
            }
        }

        if self.requires_auth(method_str) {
            if let Some(challenge) = self.check_auth(cseq, request, method_str) {
                return challenge;
            }
        }

        match &request.method {
            Method::Options => self.handle_options(cseq),
            Method::Describe => self.handle_describe(cseq, &request.uri),
            Method::Setup => self.handle_setup(cseq, request),
            Method::Play => self.handle_play(cseq, request),
            Method::Pause => self.handle_pause(cseq, request),
            Method::Teardown => self.handle_teardown(cseq, request),
            Method::Record => self.handle_record(cseq, request),
            Method::Announce => self.handle_announce(cseq, request),
            Method::SetParameter => self.handle_set_parameter(cseq, request),
            Method::GetParameter => self.handle_get_parameter(cseq, request),
            Method::Redirect | Method::Other(_) => {
                tracing::warn!(method = %method_str, %cseq, "unsupported RTSP method");
                RtspResponse::new(501, "Not Implemented").add_header("CSeq", cseq)
            }
        }
    }

    fn requires_auth(&self, method: &str) -> bool {
        !self.config.credentials.is_empty()
            && self
                .config
                .protected_methods
                .iter()
                .any(|m| m == method)
    }

    /// Resolve which [`AuthState`] governs this request (session-scoped when
    /// a `Session` header names a live session, connection-scoped otherwise
    /// — ANNOUNCE has no session yet) and verify the `Authorization` header
    /// against it, minting a fresh `401` challenge on failure.
    fn check_auth(&self, cseq: &str, request: &RtspRequest, method: &str) -> Option<RtspResponse> {
        if let Some(session_id) = self.extract_session_id(request) {
            if let Some(session) = self.session_manager.get_session(&session_id) {
                return self.authenticate(cseq, request, &session.auth, method);
            }
        }
        self.authenticate(cseq, request, &self.connection_auth, method)
    }

    fn authenticate(
        &self,
        cseq: &str,
        request: &RtspRequest,
        auth_state: &AuthState,
        method: &str,
    ) -> Option<RtspResponse> {
        let now = crate::time::milliseconds();

        match request.authorization() {
            Some(Authorization::Digest {
                username,
                uri,
                nonce,
                qop,
                nc,
                cnonce,
                response,
                ..
            }) => {
                let Some(password) = self.config.credentials.get(&username) else {
                    tracing::warn!(%cseq, username, "Digest auth: unknown user");
                    return Some(self.unauthorized_challenge(cseq, auth_state, now));
                };
                let ha1 = crate::auth::calc_ha1(&username, &self.config.digest_realm, password);
                let ok = auth_state.verify(
                    method,
                    &uri,
                    &nonce,
                    nc.as_deref(),
                    cnonce.as_deref(),
                    qop.as_deref(),
                    &response,
                    &ha1,
                );
                if ok {
                    None
                } else {
                    tracing::warn!(%cseq, username, "Digest auth: response mismatch");
                    Some(self.unauthorized_challenge(cseq, auth_state, now))
                }
            }
            Some(Authorization::Basic { token }) => {
                match crate::auth::decode_basic(&token) {
                    Some((user, pass)) if self.config.credentials.get(&user) == Some(&pass) => None,
                    _ => {
                        tracing::warn!(%cseq, "Basic auth: bad credentials");
                        Some(self.unauthorized_challenge(cseq, auth_state, now))
                    }
                }
            }
            None => Some(self.unauthorized_challenge(cseq, auth_state, now)),
        }
    }

    fn unauthorized_challenge(&self, cseq: &str, auth_state: &AuthState, now_ms: u64) -> RtspResponse {
        let (nonce, opaque) = auth_state.challenge(&self.client_addr.to_string(), now_ms);
        let stale_param = if auth_state.is_stale() { ", stale=true" } else { "" };
        let www_authenticate = format!(
            "Digest realm=\"{}\", nonce=\"{}\", opaque=\"{}\"{}",
            self.config.digest_realm, nonce, opaque, stale_param
        );
        RtspResponse::new(401, "Unauthorized")
            .add_header("CSeq", cseq)
            .add_header("WWW-Authenticate", &www_authenticate)
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok().add_header("CSeq", cseq).add_header(
            "Public",
            "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, TEARDOWN, RECORD, GET_PARAMETER, SET_PARAMETER",
        )
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let mount = match self.mounts.resolve_from_uri(uri) {
            Some(m) => m,
            None => {
                tracing::warn!(uri, "DESCRIBE for unknown mount");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let host = self.host_from_uri_or_client(uri);
        let sdp = sdp::generate_sdp(
            &mount,
            &host,
            &self.config.sdp_session_id,
            &self.config.sdp_session_version,
            &self.config.sdp_username,
            &self.config.sdp_session_name,
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", uri)
            .with_body(sdp)
    }

    /// Publish an incoming SDP description (RFC 2326 §10.10) and stand up a
    /// reflector source for it, keyed by mount path. A subsequent SETUP with
    /// `mode=RECORD` on the same path binds to this session's socket pairs.
    fn handle_announce(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let body = match std::str::from_utf8(&request.body) {
            Ok(b) if !b.trim().is_empty() => b,
            _ => {
                tracing::warn!(%cseq, "ANNOUNCE missing or non-UTF8 SDP body");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        let content_type = request.get_header("Content-Type").unwrap_or("");
        if !content_type.is_empty() && content_type != "application/sdp" {
            tracing::warn!(%cseq, content_type, "ANNOUNCE with unsupported Content-Type");
            return RtspResponse::new(415, "Unsupported Media Type").add_header("CSeq", cseq);
        }

        let source_info = match sdp::parse_source_info(body) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(%cseq, error = %e, "ANNOUNCE: invalid SDP");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        let source_id = mount::extract_mount_path(&request.uri).to_string();

        match self
            .reflectors
            .get_or_create(&source_id, &source_info, &self.udp_pool, self.client_addr.ip())
        {
            Ok(session) => {
                tracing::info!(
                    %cseq,
                    source_id,
                    streams = session.streams.len(),
                    "reflector source announced"
                );
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to create reflector session");
                RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq)
            }
        }
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let transport_header = match request.get_header("Transport") {
            Some(t) => t,
            None => {
                tracing::warn!(%cseq, "SETUP missing Transport header");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        let client_transport = match TransportHeader::parse(transport_header) {
            Some(t) => t,
            None => {
                tracing::warn!(%cseq, transport_header, "SETUP invalid Transport header");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        // RTP/AVP/TCP (interleaved) is not yet wired to either delivery
        // direction: there is no send path that writes framed RTP/RTCP back
        // over the signaling connection, and inbound interleaved frames are
        // discarded rather than forwarded to a stream (SPEC_FULL.md §4.6,
        // §3 `TCP_Interleaved`). Reject up front rather than negotiate a
        // transport this server cannot actually deliver on.
        if client_transport.is_tcp {
            tracing::warn!(%cseq, "SETUP requested RTP/AVP/TCP, which is not yet implemented; rejecting");
            return RtspResponse::new(501, "Not Implemented").add_header("CSeq", cseq);
        }

        // Reject a non-aggregate SETUP against a session that is already
        // Playing before any port allocation, so a rejected request never
        // leaks an allocated SocketPair (SPEC_FULL.md §4.7).
        if let Some(existing) = self
            .extract_session_id(request)
            .and_then(|id| self.session_manager.get_session(&id))
        {
            if existing.get_state() == SessionState::Playing {
                tracing::warn!(session_id = %existing.id, "SETUP rejected: session is already Playing");
                return RtspResponse::new(459, "Aggregate Operation Not Allowed").add_header("CSeq", cseq);
            }
        }

        let source_id = mount::extract_mount_path(&request.uri).to_string();
        let track_id = extract_track_id(&request.uri);
        let reflector_session = self.reflectors.get(&source_id);

        let (server_rtp_port, server_rtcp_port, server_pair) = if let Some(reflector) = &reflector_session {
            let stream = reflector
                .streams
                .iter()
                .find(|s| track_id.is_some_and(|t| s.track_id == t))
                .or_else(|| reflector.streams.first());
            match stream {
                Some(stream) => (
                    stream.socket_pair.rtp_port,
                    stream.socket_pair.rtcp_port,
                    Some(stream.socket_pair.clone()),
                ),
                None => {
                    tracing::error!(%cseq, source_id, "reflector session has no bound streams");
                    return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
                }
            }
        } else {
            match self
                .session_manager
                .allocate_server_ports_for(self.client_addr.ip(), client_transport.client_rtp_port)
            {
                Ok(pair) => (pair.rtp_port, pair.rtcp_port, Some(pair)),
                Err(e) => {
                    tracing::error!(error = %e, "failed to allocate server ports");
                    return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
                }
            }
        };

        // A SETUP against a live reflector source (RECORD already ANNOUNCEd,
        // or a viewer joining a pushed stream) doesn't need a registered
        // Mount — the reflector owns the media description.
        if reflector_session.is_none() && self.mounts.resolve_from_uri(&request.uri).is_none() {
            if let Some(pair) = &server_pair {
                self.session_manager.release_server_ports(pair);
            }
            tracing::warn!(uri = %request.uri, "SETUP for unknown mount");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        }

        // Reuse the session across multiple SETUPs on the same connection
        // (aggregate control of several tracks under one Session id).
        let session = match self
            .extract_session_id(request)
            .and_then(|id| self.session_manager.get_session(&id))
        {
            Some(existing) => existing,
            None => self.session_manager.create_session(&request.uri),
        };

        let session_id = session.id.clone();

        let client_rtp_addr = SocketAddr::new(self.client_addr.ip(), client_transport.client_rtp_port);

        session.set_transport(Transport {
            client_rtp_port: client_transport.client_rtp_port,
            client_rtcp_port: client_transport.client_rtcp_port,
            server_rtp_port,
            server_rtcp_port,
            client_addr: client_rtp_addr,
            ttl: client_transport.ttl,
            destination: client_transport.destination,
            mode: client_transport.mode,
            server_pair,
            interleaved_channels: client_transport.interleaved_channels,
        });

        if let Some(mount) = self.mounts.resolve_from_uri(&request.uri) {
            mount.subscribe(&session_id);
        }
        if !self.session_ids.contains(&session_id) {
            self.session_ids.push(session_id.clone());
        }

        let session_manager = self.session_manager.clone();
        let mounts = self.mounts.clone();
        let timeout_session_id = session_id.clone();
        self.timeout_task.register(&session_id, session.timeout_secs * 1000, move || {
            tracing::info!(session_id = %timeout_session_id, "session idle-timed out");
            mounts.unsubscribe_all(&timeout_session_id);
            session_manager.remove_session(&timeout_session_id);
        });

        tracing::info!(
            session_id,
            uri = %request.uri,
            client_rtp = %client_rtp_addr,
            server_rtp_port,
            mode = ?client_transport.mode,
            "session transport configured via SETUP"
        );

        let mut transport_response = format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
            client_transport.client_rtp_port,
            client_transport.client_rtcp_port,
            server_rtp_port,
            server_rtcp_port
        );
        if let Some(ttl) = client_transport.ttl {
            transport_response.push_str(&format!(";ttl={ttl}"));
        }
        if let Some(destination) = client_transport.destination {
            transport_response.push_str(&format!(";destination={destination}"));
        }
        if client_transport.mode == TransportMode::Record {
            transport_response.push_str(";mode=RECORD");
        }

        let mut response = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value());

        if request.retransmit_request().is_some() {
            response = response.add_header("x-Retransmit", "our-retransmit");
        }

        response
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "PLAY missing Session header");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        let session = match self.session_manager.get_session(&session_id) {
            Some(s) => s,
            None => {
                tracing::warn!(session_id, "PLAY for unknown session");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        let transport = session.get_transport();
        if transport.as_ref().map(|t| t.mode) == Some(TransportMode::Record) {
            tracing::warn!(session_id, "PLAY not allowed on a RECORD transport");
            return RtspResponse::new(455, "Method Not Allowed").add_header("CSeq", cseq);
        }

        let source_id = mount::extract_mount_path(&session.uri).to_string();
        if let Some(reflector) = self.reflectors.get(&source_id) {
            if let Err(e) = reflector.add_output(Output { id: session_id.clone() }, true) {
                tracing::error!(error = %e, "failed to attach reflector output");
                return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
            }
        }

        session.set_state(SessionState::Playing);
        tracing::info!(session_id, "session started playing");

        let start_secs = request.range().map(|r| r.start_secs).unwrap_or(0.0);
        let mut resp = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", &format!("npt={start_secs:.3}-"));

        if let Some(mount) = self.mounts.resolve_from_uri(&session.uri) {
            let rtp_info = format!(
                "url={};seq={};rtptime={}",
                session.uri,
                mount.next_sequence(),
                mount.next_rtp_timestamp()
            );
            resp = resp.add_header("RTP-Info", &rtp_info);
        }

        resp
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "PAUSE missing Session header");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        match self.session_manager.get_session(&session_id) {
            Some(session) => {
                session.set_state(SessionState::Paused);
                tracing::info!(session_id, "session paused");
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &session.session_header_value())
            }
            None => {
                tracing::warn!(session_id, "PAUSE for unknown session");
                RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq)
            }
        }
    }

    /// RECORD (RFC 2326 §10.11) requires a prior SETUP that negotiated
    /// `mode=RECORD`; it flips the session into [`SessionState::Recording`]
    /// so inbound RTP on its transport is treated as a publish rather than
    /// ignored.
    fn handle_record(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "RECORD missing Session header");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        let session = match self.session_manager.get_session(&session_id) {
            Some(s) => s,
            None => {
                tracing::warn!(session_id, "RECORD for unknown session");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        let mode = session.get_transport().map(|t| t.mode);
        if mode != Some(TransportMode::Record) {
            tracing::warn!(session_id, "RECORD requires a transport negotiated with mode=RECORD");
            return RtspResponse::new(455, "Method Not Allowed").add_header("CSeq", cseq);
        }

        session.set_state(SessionState::Recording);
        tracing::info!(session_id, uri = %session.uri, "source recording (publish) started");

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "TEARDOWN missing Session header");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        match self.session_manager.remove_session(&session_id) {
            Some(session) => {
                self.timeout_task.cancel(&session_id);

                let source_id = mount::extract_mount_path(&session.uri).to_string();
                if let Some(reflector) = self.reflectors.get(&source_id) {
                    reflector.remove_output(&Output { id: session_id.clone() }, true);
                } else if let Some(transport) = session.get_transport() {
                    if let Some(pair) = &transport.server_pair {
                        self.session_manager.release_server_ports(pair);
                    }
                }

                self.mounts.unsubscribe_all(&session_id);
                self.session_ids.retain(|id| id != &session_id);
                tracing::info!(session_id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(session_id, "TEARDOWN for unknown session");
                RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq)
            }
        }
    }

    /// SET_PARAMETER (RFC 2326 §10.10), accepted as a no-op parameter sink —
    /// clients also use it as a keepalive, same as GET_PARAMETER.
    fn handle_set_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "SET_PARAMETER");
        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = self.extract_session_id(request)
            && self.session_manager.get_session(&id).is_some()
        {
            resp = resp.add_header("Session", &id);
        }

        resp
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = self.extract_session_id(request)
            && self.session_manager.get_session(&id).is_some()
        {
            resp = resp.add_header("Session", &id);
        }

        resp
    }

    /// Extract session ID from the Session header.
    /// Handles timeout suffix: "SESSIONID;timeout=60" -> "SESSIONID"
    fn extract_session_id(&self, request: &RtspRequest) -> Option<String> {
        request
            .get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
    }
}

/// Pull the numeric track id off a SETUP URI's trailing track segment.
/// Accepts both the spec-canonical `a=control:trackID=<i>` convention
/// (SPEC_FULL.md §4.13, e.g. `.../trackID=1`) and the legacy `.../track1`
/// form `generate_sdp` emits for local DESCRIBE.
fn extract_track_id(uri: &str) -> Option<u32> {
    let tail = uri.rsplit("/track").next()?;
    let digits = tail.strip_prefix("ID=").unwrap_or(tail);
    digits.parse::<u32>().ok()
}

#[cfg(test)]
mod track_id_tests {
    use super::extract_track_id;

    #[test]
    fn parses_canonical_track_id_form() {
        assert_eq!(extract_track_id("rtsp://h/live.sdp/trackID=1"), Some(1));
    }

    #[test]
    fn parses_legacy_track_form() {
        assert_eq!(extract_track_id("rtsp://h/live.sdp/track1"), Some(1));
    }

    #[test]
    fn returns_none_without_a_track_segment() {
        assert_eq!(extract_track_id("rtsp://h/live.sdp"), None);
    }
}
