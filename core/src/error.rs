//! Error types for the RTSP server library.

use std::fmt;

/// Errors that can occur in the RTSP server library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io) — socket/network failures.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`SessionNotPlaying`](Self::SessionNotPlaying),
///   [`TransportNotConfigured`](Self::TransportNotConfigured).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
/// - **Mount**: [`MountNotFound`](Self::MountNotFound).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// SETUP has not been completed for this session (no UDP ports negotiated).
    #[error("transport not configured for session: {0}")]
    TransportNotConfigured(String),

    /// Attempted to send media to a session that is not in the Playing state.
    #[error("session not in playing state: {0}")]
    SessionNotPlaying(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Server-side UDP port allocation exhausted the 5000–65534 range.
    #[error("port range exhausted (tried to allocate beyond u16 range)")]
    PortRangeExhausted,

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// Client request was malformed or violated an FSM invariant; maps to 400.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Request lacked valid credentials; maps to 401 with a fresh challenge.
    #[error("unauthorized")]
    Unauthorized,

    /// Request is disallowed for policy reasons (e.g. reflection of a
    /// non-reflectable address); maps to 403.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Requested resource exists but is not available in this form; maps to 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// The method is not valid for the resource/state; maps to 455.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// A non-aggregate operation was attempted mid-PLAY; maps to 459.
    #[error("aggregate operation not allowed")]
    AggregateOptionDisallowed,

    /// The described media uses a codec this server cannot packetize; maps to 415.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    /// Internal invariant violation; maps to 500, logged with component context.
    #[error("internal error in {component}: {detail}")]
    Internal { component: &'static str, detail: String },
}

impl RtspError {
    /// The RTSP status code this error maps to at the response boundary
    /// (SPEC_FULL.md §7). Exactly one status per variant — no fallthrough
    /// to a generic 500 for a variant that names a more specific code.
    pub fn status_code(&self) -> u16 {
        match self {
            RtspError::BadRequest(_) => 400,
            RtspError::Unauthorized => 401,
            RtspError::Forbidden(_) => 403,
            RtspError::NotFound(_) | RtspError::SessionNotFound(_) | RtspError::MountNotFound(_) => 404,
            RtspError::UnsupportedMedia(_) => 415,
            RtspError::MethodNotAllowed(_) => 455,
            RtspError::AggregateOptionDisallowed => 459,
            RtspError::Parse { .. } => 400,
            RtspError::TransportNotConfigured(_) | RtspError::SessionNotPlaying(_) => 400,
            RtspError::PortRangeExhausted
            | RtspError::Internal { .. }
            | RtspError::Io(_)
            | RtspError::NotStarted
            | RtspError::AlreadyRunning => 500,
        }
    }

    /// Standard reason phrase for [`status_code`](Self::status_code).
    pub fn reason_phrase(&self) -> &'static str {
        match self.status_code() {
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            415 => "Unsupported Media Type",
            455 => "Method Not Allowed",
            459 => "Aggregate Operation Not Allowed",
            _ => "Internal Server Error",
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_specific() {
        assert_eq!(RtspError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(RtspError::Unauthorized.status_code(), 401);
        assert_eq!(RtspError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(RtspError::NotFound("x".into()).status_code(), 404);
        assert_eq!(RtspError::SessionNotFound("x".into()).status_code(), 404);
        assert_eq!(RtspError::UnsupportedMedia("x".into()).status_code(), 415);
        assert_eq!(RtspError::MethodNotAllowed("x".into()).status_code(), 455);
        assert_eq!(RtspError::AggregateOptionDisallowed.status_code(), 459);
        assert_eq!(
            RtspError::Internal {
                component: "test",
                detail: "x".into()
            }
            .status_code(),
            500
        );
    }
}
