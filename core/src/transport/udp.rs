use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::error::{Result, RtspError};
use crate::session::SessionManager;

/// UDP transport for outbound RTP packet delivery.
///
/// Binds a single ephemeral socket (`0.0.0.0:0`) and sends RTP packets
/// to client addresses resolved by the [`Server`](crate::Server).
///
/// This layer is deliberately address-only — it does not know about
/// sessions or mounts. The caller resolves session state to socket
/// addresses before calling [`send_to`](Self::send_to).
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket for outbound RTP.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }

    /// Resolve `session_id` to its negotiated client transport address and
    /// deliver `payload` there.
    pub fn send_to_session(
        &self,
        session_manager: &SessionManager,
        session_id: &str,
        payload: &[u8],
    ) -> Result<usize> {
        let session = session_manager
            .get_session(session_id)
            .ok_or_else(|| RtspError::SessionNotFound(session_id.to_string()))?;
        let transport = session
            .get_transport()
            .ok_or_else(|| RtspError::TransportNotConfigured(session_id.to_string()))?;
        self.send_to(payload, transport.client_addr)
    }

    /// Deliver `payload` to every session currently in the Playing state.
    /// Per-viewer send failures are logged and skipped rather than
    /// aborting the whole fan-out.
    pub fn broadcast(&self, session_manager: &SessionManager, payload: &[u8]) -> Result<usize> {
        let mut total = 0;
        for session in session_manager.get_playing_sessions() {
            if let Some(transport) = session.get_transport() {
                match self.send_to(payload, transport.client_addr) {
                    Ok(n) => total += n,
                    Err(e) => {
                        tracing::warn!(session_id = %session.id, error = %e, "broadcast send failed")
                    }
                }
            }
        }
        Ok(total)
    }
}
