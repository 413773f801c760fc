//! Wire-stable structured error shared by local handlers, remote calls, and
//! the RPC client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Short, wire-stable error code.
///
/// These strings cross the peer RPC boundary verbatim and must never change
/// once published.
pub const CODE_BAD_REQUEST: &str = "PIT-400";
/// Route or session not found.
pub const CODE_NOT_FOUND: &str = "PIT-404";
/// Default/unknown error, used when no other code applies.
pub const CODE_UNKNOWN: &str = "PIT-450";
/// The client closed the request before a reply was produced.
pub const CODE_CLIENT_CLOSED: &str = "PIT-499";
/// Internal error (transport failure, panic, pool exhaustion, ...).
pub const CODE_INTERNAL: &str = "PIT-500";

/// Numeric counterpart of a wire-stable code.
#[must_use]
pub const fn numeric_for_code(code: &str) -> i32 {
    match code.as_bytes() {
        b"PIT-400" => 400,
        b"PIT-404" => 404,
        b"PIT-499" => 499,
        b"PIT-500" => 500,
        _ => 450,
    }
}

/// Structured error propagated through pipelines, handlers, and the peer
/// wire protocol.
///
/// An empty `code` is never constructed directly; use [`Error::unknown`] or
/// [`Error::canonicalize`] so the wire-stable fallback is applied in one
/// place.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct Error {
    /// Wire-stable short code, e.g. `PIT-404`.
    pub code: String,
    /// Numeric counterpart of `code`.
    pub numeric: i32,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary key/value context attached by middleware or handlers.
    pub metadata: HashMap<String, String>,
}

impl Error {
    /// Builds a new structured error with the given code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let numeric = numeric_for_code(&code);
        Self {
            code,
            numeric,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    /// Builds the default "unknown" error from an arbitrary display-able cause.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self { Self::new(CODE_UNKNOWN, message) }

    /// Builds a bad-request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self { Self::new(CODE_BAD_REQUEST, message) }

    /// Builds a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self { Self::new(CODE_NOT_FOUND, message) }

    /// Builds an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self { Self::new(CODE_INTERNAL, message) }

    /// Builds a client-closed-request error.
    #[must_use]
    pub fn client_closed(message: impl Into<String>) -> Self {
        Self::new(CODE_CLIENT_CLOSED, message)
    }

    /// Attaches a metadata key/value pair, overwriting an existing key.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merges `other`'s metadata into `self`, keeping `self`'s values on
    /// conflict, and mirrors the original's "wrap an existing structured
    /// error" behaviour: the code and message of `self` win.
    #[must_use]
    pub fn merge_metadata(mut self, other: &Self) -> Self {
        for (k, v) in &other.metadata {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    /// Canonicalizes an empty wire code to [`CODE_UNKNOWN`].
    ///
    /// Call this on every error reconstructed from the wire: a peer may
    /// legitimately send an empty code when it wrapped a non-structured
    /// error, and callers must not observe an empty code locally.
    #[must_use]
    pub fn canonicalize(mut self) -> Self {
        if self.code.is_empty() {
            self.code = CODE_UNKNOWN.to_owned();
            self.numeric = numeric_for_code(CODE_UNKNOWN);
        }
        self
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self { Self::unknown(err.to_string()) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CODE_BAD_REQUEST, 400)]
    #[case(CODE_NOT_FOUND, 404)]
    #[case(CODE_UNKNOWN, 450)]
    #[case(CODE_CLIENT_CLOSED, 499)]
    #[case(CODE_INTERNAL, 500)]
    #[case("", 450)]
    fn numeric_matches_code(#[case] code: &str, #[case] expected: i32) {
        assert_eq!(numeric_for_code(code), expected);
    }

    #[test]
    fn canonicalize_fills_empty_code() {
        let err = Error {
            code: String::new(),
            numeric: 0,
            message: "boom".to_owned(),
            metadata: HashMap::new(),
        }
        .canonicalize();
        assert_eq!(err.code, CODE_UNKNOWN);
        assert_eq!(err.numeric, 450);
    }

    #[test]
    fn merge_metadata_keeps_self_on_conflict() {
        let a = Error::bad_request("a").with_metadata("k", "a-value");
        let b = Error::bad_request("b").with_metadata("k", "b-value").with_metadata("j", "j-value");
        let merged = a.merge_metadata(&b);
        assert_eq!(merged.metadata.get("k").map(String::as_str), Some("a-value"));
        assert_eq!(merged.metadata.get("j").map(String::as_str), Some("j-value"));
    }
}
