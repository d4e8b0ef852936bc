//! bouncer_common
//!
//! Canonical JSON serialization + hashing utilities, opaque id generation,
//! and the single markup-escaping helper used by everything that renders
//! user-supplied strings into an approver-facing message.
//!
//! IMPORTANT: Do not "pretty print" for hashing. Hashes are computed over
//! canonical bytes: sorted keys, no whitespace, UTF-8.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("failed to serialize json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize to canonical JSON bytes:
/// - stable key ordering (we enforce sorting via Value roundtrip)
/// - no whitespace
/// - UTF-8
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_json_value(v);
    Ok(serde_json::to_vec(&sorted)?)
}

/// Return "sha256:<hex>" of canonical JSON bytes.
pub fn sha256_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(sha256_bytes(&bytes))
}

/// Return "sha256:<hex>" of raw bytes.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    format!("sha256:{}", hex::encode(digest))
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

/// Current UTC timestamp. Centralized so every caller shares one clock.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A URL-safe, high-entropy opaque identifier. Used for request ids, grant
/// ids, and anything else that must not be guessable or collide.
pub fn opaque_id(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(prefix.len() + 1 + len);
    out.push_str(prefix);
    out.push('_');
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    for b in buf {
        out.push(ID_ALPHABET[(b as usize) % ID_ALPHABET.len()] as char);
    }
    out
}

/// The single place that knows how to escape user-controlled text for the
/// chat markup language. Values placed inside code entities (inline code,
/// code blocks) are never escaped -- the code entity itself is the escape.
/// Values placed in plain text are always escaped here. Centralizing this
/// is the point: callers never hand-roll escaping, so there is exactly one
/// rule to audit.
pub fn escape_markup_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '='
            | '|' | '{' | '}' | '.' | '!' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

/// Truncate a string to at most `max_chars` characters (char-boundary safe),
/// appending a marker if truncation happened.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars).collect();
    out.push_str("…[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Obj {
        b: u32,
        a: u32,
    }

    #[test]
    fn canonical_hash_is_stable() {
        let x = Obj { b: 2, a: 1 };
        let y = Obj { a: 1, b: 2 };
        let hx = sha256_canonical_json(&x).unwrap();
        let hy = sha256_canonical_json(&y).unwrap();
        assert_eq!(hx, hy);
    }

    #[test]
    fn opaque_id_has_prefix_and_length() {
        let id = opaque_id("req", 16);
        assert!(id.starts_with("req_"));
        assert_eq!(id.len(), "req_".len() + 16);
    }

    #[test]
    fn escape_markup_escapes_special_chars() {
        let escaped = escape_markup_text("a_b*c[d]");
        assert_eq!(escaped, "a\\_b\\*c\\[d\\]");
    }

    #[test]
    fn truncate_chars_respects_limit() {
        let long = "x".repeat(50);
        let t = truncate_chars(&long, 10);
        assert!(t.starts_with("xxxxxxxxxx"));
        assert!(t.contains("truncated"));
    }
}
