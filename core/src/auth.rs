//! Basic and Digest authentication primitives (RFC 2617).
//!
//! Provides MD5 hex digests, base64 decoding for `Authorization: Basic`,
//! and the HA1/HA2/response combinators the Digest scheme is built from.
//! The session FSM (C7, `session::auth`) owns nonce lifecycle and challenge
//! construction; this module is pure functions over strings.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};

/// Compute the lowercase hex MD5 digest of `input`, per RFC 1321.
pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex32(&hasher.finalize())
}

/// Render a 16-byte digest as 32 lowercase hex characters.
pub fn hex32(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Decode a base64-encoded `Authorization: Basic <token>` payload into
/// `user:pass`. Returns `None` on malformed base64 or missing `:`.
pub fn decode_basic(token: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(token.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Encode raw bytes as base64 (used for the Digest `opaque` value and for
/// `sprop-parameter-sets` elsewhere in the crate).
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// `HA1 = MD5(user ':' realm ':' pass)` (RFC 2617 §3.2.2.2, no `algorithm` param).
pub fn calc_ha1(username: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{username}:{realm}:{password}"))
}

/// `HA1 = MD5(MD5(user ':' realm ':' pass) ':' nonce ':' cnonce)` for `algorithm=MD5-sess`.
pub fn calc_ha1_sess(username: &str, realm: &str, password: &str, nonce: &str, cnonce: &str) -> String {
    let ha1 = calc_ha1(username, realm, password);
    md5_hex(&format!("{ha1}:{nonce}:{cnonce}"))
}

/// `HA2 = MD5(method ':' uri)` for `qop` absent or `"auth"`.
pub fn calc_ha2(method: &str, uri: &str) -> String {
    md5_hex(&format!("{method}:{uri}"))
}

/// `HA2 = MD5(method ':' uri ':' MD5(entity-body))` for `qop="auth-int"`.
pub fn calc_ha2_auth_int(method: &str, uri: &str, entity_body: &str) -> String {
    let body_hash = md5_hex(entity_body);
    md5_hex(&format!("{method}:{uri}:{body_hash}"))
}

/// `response = MD5(HA1 ':' nonce ':' nc ':' cnonce ':' qop ':' HA2)` with `qop`,
/// or `MD5(HA1 ':' nonce ':' HA2)` without — both per RFC 2617 §3.2.2.1.
pub fn calc_request_digest(
    ha1: &str,
    nonce: &str,
    nc_cnonce_qop: Option<(&str, &str, &str)>,
    ha2: &str,
) -> String {
    match nc_cnonce_qop {
        Some((nc, cnonce, qop)) => md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}")),
        None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    }
}
