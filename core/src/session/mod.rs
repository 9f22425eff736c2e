//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created during SETUP and
//! destroyed by TEARDOWN (or timeout). It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - The playback state: Ready -> Playing <-> Paused.
//! - Transport parameters (client/server UDP ports) negotiated during SETUP.
//! - A timeout (default 60s, per RFC 2326 §12.37) — the client must send
//!   a request (e.g. GET_PARAMETER) before the timeout expires.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP         -> Ready
//! PLAY          -> Playing
//! PAUSE         -> Paused   (from Playing)
//! PLAY          -> Playing  (from Paused)
//! TEARDOWN      -> (removed)
//! TCP disconnect -> (removed, via cleanup)
//! ```

pub mod auth;
pub mod transport;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::net::udp_pool::UdpSocketPool;
pub use auth::AuthState;
pub use transport::Transport;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// RTSP session state machine (RFC 2326 §A.1, SPEC_FULL.md §4.7):
/// `Init -> Ready -> Playing <-> Paused`, `Ready -> Recording`, any state
/// -> `TearingDown` -> removed via [`SessionManager::remove_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session object exists (e.g. pre-allocated for a DESCRIBE/SETUP
    /// pair) but SETUP has not yet negotiated a transport.
    Init,
    /// Session created via SETUP, not yet playing.
    Ready,
    /// Media is being delivered (RTP packets sent to client).
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
    /// RECORD accepted a `mode=RECORD` transport; server consumes inbound RTP.
    Recording,
    /// TEARDOWN received; session is being torn down and will be removed.
    TearingDown,
}

/// A single RTSP session (RFC 2326 §3).
///
/// Created during SETUP, destroyed by TEARDOWN or TCP disconnect.
/// Interior mutability via `RwLock` allows shared references across threads.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// The RTSP URI this session was created for (from the SETUP request).
    pub uri: String,
    /// Transport parameters negotiated during SETUP (RFC 2326 §12.39).
    pub transport: RwLock<Option<Transport>>,
    /// Current playback state.
    pub state: RwLock<SessionState>,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    /// Digest authentication challenge state, scoped to this session.
    pub auth: AuthState,
}

impl Session {
    /// Create a new session with a unique auto-incrementing ID.
    pub fn new(uri: &str) -> Self {
        Self::with_timeout(uri, DEFAULT_SESSION_TIMEOUT_SECS)
    }

    pub fn with_timeout(uri: &str, timeout_secs: u64) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Session {
            id: format!("{:016X}", id),
            uri: uri.to_string(),
            transport: RwLock::new(None),
            state: RwLock::new(SessionState::Ready),
            timeout_secs,
            auth: AuthState::new(),
        }
    }

    /// Set the transport parameters (called during SETUP).
    pub fn set_transport(&self, transport: Transport) {
        tracing::debug!(session_id = %self.id, client_addr = %transport.client_addr, "transport configured");
        *self.transport.write() = Some(transport);
    }

    /// Returns a clone of the transport parameters, if configured.
    pub fn get_transport(&self) -> Option<Transport> {
        self.transport.read().clone()
    }

    /// Transition to a new playback state.
    pub fn set_state(&self, state: SessionState) {
        tracing::debug!(session_id = %self.id, old_state = ?*self.state.read(), new_state = ?state, "state transition");
        *self.state.write() = state;
    }

    /// Returns the current playback state.
    pub fn get_state(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Whether this session is actively receiving media.
    pub fn is_playing(&self) -> bool {
        *self.state.read() == SessionState::Playing
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"0000000000000001;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads. Session
/// lookups happen on every RTP delivery cycle, so read performance matters.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    udp_pool: Arc<UdpSocketPool>,
    default_timeout_secs: u64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_pool(Arc::new(UdpSocketPool::new()))
    }

    /// Create a manager that allocates SETUP ports from a shared
    /// [`UdpSocketPool`] (SPEC_FULL.md §4.4) rather than a bare counter.
    pub fn with_pool(udp_pool: Arc<UdpSocketPool>) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            udp_pool,
            default_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }

    pub fn with_pool_and_timeout(udp_pool: Arc<UdpSocketPool>, default_timeout_secs: u64) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            udp_pool,
            default_timeout_secs,
        }
    }

    /// Create a new session for the given URI and register it.
    pub fn create_session(&self, uri: &str) -> Arc<Session> {
        let session = Arc::new(Session::with_timeout(uri, self.default_timeout_secs));
        let id = session.id.clone();
        self.sessions.write().insert(id.clone(), session.clone());

        let total = self.sessions.read().len();
        tracing::debug!(session_id = %id, uri, total_sessions = total, "session created");

        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID (used by TEARDOWN).
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            let total = self.sessions.read().len();
            tracing::debug!(session_id = %id, total_sessions = total, "session removed");
        }
        removed
    }

    /// Remove multiple sessions at once (used during TCP disconnect cleanup).
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let mut sessions = self.sessions.write();
        let mut removed = 0;
        for id in ids {
            if sessions.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    /// Allocate a pair of (RTP, RTCP) server ports for a SETUP from a
    /// client at `src_ip:src_port`, via the shared [`UdpSocketPool`]
    /// (SPEC_FULL.md §4.4). Binds real sockets; callers that no longer
    /// need the pair should release it via
    /// [`release_server_ports`](Self::release_server_ports) at TEARDOWN.
    pub fn allocate_server_ports_for(
        &self,
        src_ip: IpAddr,
        src_port: u16,
    ) -> Result<Arc<crate::net::udp_pool::SocketPair>> {
        let pair = self
            .udp_pool
            .get_pair(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, src_ip, src_port)?;
        tracing::trace!(
            rtp_port = pair.rtp_port,
            rtcp_port = pair.rtcp_port,
            "allocated server ports"
        );
        Ok(pair)
    }

    /// Release a previously-allocated socket pair, returning it to the pool
    /// once its refcount reaches zero.
    pub fn release_server_ports(&self, pair: &Arc<crate::net::udp_pool::SocketPair>) {
        self.udp_pool.release(pair);
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn get_playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
