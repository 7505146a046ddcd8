//! Caller identity for the HTTP surface.
//!
//! The upstream application authenticates users itself and forwards who is
//! asking in `x-user-id` / `x-user-role`. A shared bearer token, when
//! configured, proves the request came from that application.

use axum::http::HeaderMap;

use crate::visibility::{Role, Viewer};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Constant-time token comparison. Empty tokens never match.
pub fn validate_token(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    if provided.is_empty() || expected.is_empty() {
        return false;
    }

    let len_match = provided.len() == expected.len();

    let mut diff: u8 = 0;
    for (a, b) in provided.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }

    len_match && diff == 0
}

/// Token from an `Authorization: Bearer <token>` value. The scheme is
/// case-insensitive.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    let prefix = header.get(..7)?;
    if !prefix.eq_ignore_ascii_case("Bearer ") {
        return None;
    }

    let token = header[7..].trim();
    (!token.is_empty()).then_some(token)
}

/// Viewer described by the identity headers. Anything missing or
/// unparseable means anonymous.
pub fn viewer_from_headers(headers: &HeaderMap) -> Viewer {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let id = header(USER_ID_HEADER).and_then(|v| v.trim().parse::<u64>().ok());
    let role = header(USER_ROLE_HEADER).and_then(|v| v.parse::<Role>().ok());

    match (id, role) {
        (Some(id), Some(role)) => Viewer::user(id, role),
        _ => Viewer::Anonymous,
    }
}
