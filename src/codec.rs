//! # Canonical Encoding and Checksums
//!
//! Records, commit objects and event payloads are stored as JSON. Two parts of
//! the system need the exact bytes to be deterministic:
//!
//! - Content addressing: the same record must always hash to the same
//!   [`Cid`](crate::types::Cid), no matter how the caller ordered its keys.
//! - Signing: the commit signature covers the encoded unsigned commit.
//!
//! ## Canonical Form
//!
//! ```text
//! - object keys sorted by their UTF-8 bytes
//! - no insignificant whitespace
//! - strings and numbers written exactly as serde_json writes them
//! ```
//!
//! The encoder walks the value itself instead of relying on `serde_json::Map`
//! ordering, which changes when any crate in the build enables
//! `preserve_order`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// Canonical JSON
// =============================================================================

/// Encodes a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Serializes any value to JSON, then encodes it in canonical form.
pub fn encode_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    canonical_json(&serde_json::to_value(value)?)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

// =============================================================================
// Checksums
// =============================================================================

/// Computes a checksum for a stored event payload.
///
/// Uses XXH3-64. It is not a security boundary, only a torn-write and
/// bit-rot detector for rows in `repo_seq`.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    xxhash_rust::xxh3::xxh3_64(data).to_le_bytes().to_vec()
}

/// Verifies a stored checksum, returning `Error::Corruption` on mismatch.
pub fn verify_checksum(data: &[u8], checksum: &[u8], what: impl FnOnce() -> String) -> Result<()> {
    if compute_checksum(data) == checksum {
        Ok(())
    } else {
        Err(Error::Corruption(format!("checksum mismatch for {}", what())))
    }
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_canonical_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [3, {"k": "v", "c": null}]}});
        let encoded = canonical_json(&a).unwrap();
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            r#"{"a":{"y":[3,{"c":null,"k":"v"}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_independent_of_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("text".into(), json!("hi"));
        first.insert("$type".into(), json!("app.example.post"));

        let mut second = serde_json::Map::new();
        second.insert("$type".into(), json!("app.example.post"));
        second.insert("text".into(), json!("hi"));

        assert_eq!(
            canonical_json(&Value::Object(first)).unwrap(),
            canonical_json(&Value::Object(second)).unwrap()
        );
    }

    #[test]
    fn test_canonical_escapes_strings() {
        let v = json!({"quote\"key": "line\nbreak"});
        let encoded = String::from_utf8(canonical_json(&v).unwrap()).unwrap();
        assert_eq!(encoded, r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn test_checksum_deterministic() {
        let data = b"test data for checksum";
        assert_eq!(compute_checksum(data), compute_checksum(data));
        assert_ne!(compute_checksum(b"data1"), compute_checksum(b"data2"));
    }

    #[test]
    fn test_verify_checksum() {
        let sum = compute_checksum(b"payload");
        assert!(verify_checksum(b"payload", &sum, || "seq 1".into()).is_ok());

        let err = verify_checksum(b"payl0ad", &sum, || "seq 1".into()).unwrap_err();
        assert!(matches!(err, Error::Corruption(ref m) if m.contains("seq 1")));
    }
}
