use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::mount::MountRegistry;
use crate::net::udp_pool::UdpSocketPool;
use crate::protocol::MethodHandler;
use crate::protocol::request::InterleavedFrame;
use crate::protocol::RtspRequest;
use crate::reflector::{Output, ReflectorRegistry};
use crate::server::ServerConfig;
use crate::session::SessionManager;
use crate::timeout::TimeoutTask;

const READ_CHUNK_BYTES: usize = 4096;

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
#[allow(clippy::too_many_arguments)]
pub fn accept_loop(
    listener: TcpListener,
    session_manager: SessionManager,
    mounts: MountRegistry,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
    reflectors: Arc<ReflectorRegistry>,
    timeout_task: TimeoutTask,
    udp_pool: Arc<UdpSocketPool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sm = session_manager.clone();
                let r = running.clone();
                let m = mounts.clone();
                let c = config.clone();
                let rf = reflectors.clone();
                let tt = timeout_task.clone();
                let up = udp_pool.clone();
                thread::spawn(move || {
                    Connection::handle(stream, sm, m, c, r, rf, tt, up);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
///
/// Reads into a raw byte buffer rather than a line reader: interleaved
/// RTP/RTCP frames (RFC 2326 §10.12) share the TCP stream with RTSP
/// text and carry no line structure, so framing must be done at the
/// byte level before text parsing is attempted.
struct Connection {
    stream: TcpStream,
    handler: MethodHandler,
    peer_addr: SocketAddr,
    buf: Vec<u8>,
    max_header_bytes: usize,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    #[allow(clippy::too_many_arguments)]
    pub fn handle(
        stream: TcpStream,
        session_manager: SessionManager,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
        reflectors: Arc<ReflectorRegistry>,
        timeout_task: TimeoutTask,
        udp_pool: Arc<UdpSocketPool>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        let _ = stream.set_read_timeout(Some(Duration::from_millis(250)));

        let handler = MethodHandler::new(
            session_manager.clone(),
            peer_addr,
            mounts.clone(),
            config.clone(),
            reflectors.clone(),
            timeout_task.clone(),
            udp_pool,
        );

        let mut conn = Connection {
            stream,
            handler,
            peer_addr,
            buf: Vec::new(),
            max_header_bytes: config.max_request_header_bytes,
        };

        let reason = conn.run(&running);
        conn.cleanup(&session_manager, &mounts, &reflectors, &timeout_task);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        let mut chunk = [0u8; READ_CHUNK_BYTES];

        while running.load(Ordering::SeqCst) {
            // Drain every complete unit (interleaved frame or RTSP message)
            // already sitting in the buffer before blocking on more bytes.
            loop {
                match self.try_consume_interleaved_frame() {
                    Some(true) => continue,
                    Some(false) => return "write error",
                    None => {}
                }
                match self.try_consume_request() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(reason) => return reason,
                }
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => return "connection closed by client",
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => return "read error",
            }
        }

        "server shutting down"
    }

    /// If the buffer starts with an interleaved-frame marker (`$`), consume
    /// and discard it. SETUP rejects `RTP/AVP/TCP` (see `handler::handle_setup`),
    /// so no compliant client should ever frame data this way; kept as a
    /// defensive drain in case one does anyway, rather than letting stray
    /// `$` bytes desync the request parser.
    /// Returns `Some(true)` if a frame was consumed, `Some(false)` on a
    /// write failure, `None` if the buffer doesn't start with a frame or
    /// doesn't yet hold a complete one.
    fn try_consume_interleaved_frame(&mut self) -> Option<bool> {
        if self.buf.first() != Some(&InterleavedFrame::MARKER) {
            return None;
        }
        match InterleavedFrame::try_parse(&self.buf) {
            Some((frame, consumed)) => {
                tracing::trace!(
                    peer = %self.peer_addr,
                    channel = frame.channel,
                    len = frame.payload.len(),
                    "interleaved frame received"
                );
                self.buf.drain(..consumed);
                Some(true)
            }
            None => None,
        }
    }

    /// Try to parse a complete RTSP request (headers + any Content-Length
    /// body) out of the front of the buffer and dispatch it.
    ///
    /// Returns `Ok(true)` if a request was consumed and handled, `Ok(false)`
    /// if the buffer doesn't yet hold a complete request, `Err(reason)` on
    /// an unrecoverable connection error (oversized headers, write failure).
    fn try_consume_request(&mut self) -> Result<bool, &'static str> {
        let (header_end, sep_len) = match find_header_end(&self.buf) {
            Some(pos) => pos,
            None => {
                if self.buf.len() > self.max_header_bytes {
                    tracing::warn!(peer = %self.peer_addr, "request headers exceeded size cap");
                    let resp = crate::protocol::RtspResponse::bad_request()
                        .add_header("CSeq", "0")
                        .serialize();
                    let _ = self.stream.write_all(resp.as_bytes());
                    return Err("request too large");
                }
                return Ok(false);
            }
        };

        let header_bytes = &self.buf[..header_end];
        let header_text = match std::str::from_utf8(header_bytes) {
            Ok(s) => s.to_string(),
            Err(_) => {
                tracing::warn!(peer = %self.peer_addr, "request headers not valid UTF-8");
                self.buf.drain(..header_end + sep_len);
                return Ok(true);
            }
        };

        let mut request = match RtspRequest::parse(&header_text) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                self.buf.drain(..header_end + sep_len);
                let resp = crate::protocol::RtspResponse::bad_request()
                    .add_header("CSeq", "0")
                    .serialize();
                if self.stream.write_all(resp.as_bytes()).is_err() {
                    return Err("write error");
                }
                return Ok(true);
            }
        };

        let content_length = request.content_length();
        let body_start = header_end + sep_len;
        if self.buf.len() < body_start + content_length {
            return Ok(false);
        }

        request.body = self.buf[body_start..body_start + content_length].to_vec();
        self.buf.drain(..body_start + content_length);

        tracing::debug!(
            peer = %self.peer_addr,
            method = request.method.as_str(),
            uri = %request.uri,
            version = %request.version,
            "request"
        );

        let response = self.handler.handle(&request);

        tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");

        if self.stream.write_all(response.serialize().as_bytes()).is_err() {
            return Err("write error");
        }

        Ok(true)
    }

    /// Clean up sessions owned by this connection: cancel idle timeouts,
    /// detach reflector outputs / release UDP ports, and unsubscribe from
    /// mounts, for every session this connection's SETUPs created.
    fn cleanup(
        &self,
        session_manager: &SessionManager,
        mounts: &MountRegistry,
        reflectors: &ReflectorRegistry,
        timeout_task: &TimeoutTask,
    ) {
        let orphaned = self.handler.session_ids().to_vec();
        if orphaned.is_empty() {
            return;
        }

        for id in &orphaned {
            timeout_task.cancel(id);
            mounts.unsubscribe_all(id);

            if let Some(session) = session_manager.get_session(id) {
                let source_id = crate::mount::extract_mount_path(&session.uri).to_string();
                if let Some(reflector) = reflectors.get(&source_id) {
                    reflector.remove_output(&Output { id: id.clone() }, true);
                } else if let Some(transport) = session.get_transport() {
                    if let Some(pair) = &transport.server_pair {
                        session_manager.release_server_ports(pair);
                    }
                }
            }
        }

        let removed = session_manager.remove_sessions(&orphaned);
        tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
    }
}

/// Find the end of the header block (`\r\n\r\n` or a bare `\n\n`), returning
/// `(offset of its first byte, separator length)`, or `None` if not yet
/// present in the buffer.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2))
}
