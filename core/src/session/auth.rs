//! Per-session Digest authentication state (RFC 2617, SPEC_FULL.md §4.7).
//!
//! A session challenges at most one nonce at a time: the first
//! unauthenticated privileged request mints a nonce from the session id
//! and the current clock, then reuses it across subsequent challenges,
//! bumping a nonce-count and flagging `stale` when the client's count
//! falls behind what the server already issued.

use parking_lot::Mutex;

use crate::auth;

/// Digest challenge state scoped to one session.
pub struct AuthState {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState").finish_non_exhaustive()
    }
}

struct Inner {
    nonce: Option<String>,
    opaque: Option<String>,
    nonce_count: u32,
    stale: bool,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nonce: None,
                opaque: None,
                nonce_count: 0,
                stale: false,
            }),
        }
    }

    /// Mint (or return the existing) nonce/opaque pair for this session,
    /// marking `stale` if a previously-issued nonce is being re-challenged.
    pub fn challenge(&self, session_id: &str, now_ms: u64) -> (String, String) {
        let mut inner = self.inner.lock();

        if inner.nonce_count > 0 {
            inner.stale = true;
        }
        inner.nonce_count += 1;

        let nonce = inner
            .nonce
            .get_or_insert_with(|| auth::md5_hex(&format!("{session_id}:{now_ms}")))
            .clone();
        let opaque = inner
            .opaque
            .get_or_insert_with(|| {
                let random: u32 = rand::random();
                auth::encode_base64(&random.to_be_bytes())
            })
            .clone();

        (nonce, opaque)
    }

    pub fn is_stale(&self) -> bool {
        self.inner.lock().stale
    }

    pub fn current_nonce(&self) -> Option<String> {
        self.inner.lock().nonce.clone()
    }

    /// Verify Digest credentials presented in an `Authorization` header.
    ///
    /// `expected_ha1` is the caller's precomputed `HA1` for the claimed
    /// username (looked up against whatever credential store backs the
    /// server; this module is agnostic to where `HA1` comes from).
    pub fn verify(
        &self,
        method: &str,
        uri: &str,
        nonce: &str,
        nc: Option<&str>,
        cnonce: Option<&str>,
        qop: Option<&str>,
        response: &str,
        expected_ha1: &str,
    ) -> bool {
        if Some(nonce.to_string()) != self.current_nonce() {
            return false;
        }

        let ha2 = auth::calc_ha2(method, uri);
        let nc_cnonce_qop = match (nc, cnonce, qop) {
            (Some(nc), Some(cnonce), Some(qop)) => Some((nc, cnonce, qop)),
            _ => None,
        };
        let expected = auth::calc_request_digest(expected_ha1, nonce, nc_cnonce_qop, &ha2);
        expected == response
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_idempotent_across_retries() {
        let auth = AuthState::new();
        let (nonce1, opaque1) = auth.challenge("session-1", 1000);
        let (nonce2, opaque2) = auth.challenge("session-1", 1000);
        assert_eq!(nonce1, nonce2);
        assert_eq!(opaque1, opaque2);
    }

    #[test]
    fn second_challenge_marks_stale() {
        let auth = AuthState::new();
        auth.challenge("session-1", 1000);
        assert!(!auth.is_stale());
        auth.challenge("session-1", 1000);
        assert!(auth.is_stale());
    }

    #[test]
    fn verify_matches_rfc2617_worked_example() {
        let auth = AuthState::new();
        let ha1 = crate::auth::calc_ha1("Mufasa", "testrealm@host.com", "Circle Of Life");
        {
            let mut inner = auth.inner.lock();
            inner.nonce = Some("dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string());
        }

        assert!(auth.verify(
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some("00000001"),
            Some("0a4f113b"),
            Some("auth"),
            "6629fae49393a05397450978507c4ef1",
            &ha1,
        ));
    }

    #[test]
    fn verify_rejects_mismatched_nonce() {
        let auth = AuthState::new();
        auth.challenge("session-1", 1000);
        assert!(!auth.verify(
            "SETUP",
            "rtsp://host/stream",
            "not-the-issued-nonce",
            None,
            None,
            None,
            "deadbeef",
            "ha1",
        ));
    }
}
