//! Canonical encodings.
//!
//! Two independent encodings are used across the engine:
//! - a canonical binary encoding (`bincode`, little-endian, fixed-int)
//!   used for block/vote/proposal storage and over the wire;
//! - a canonical JSON encoding with sorted keys, used only to compute
//!   the bytes a validator signs (`SignBytes`). The JSON form is
//!   pinned so that two validators signing logically identical content
//!   always sign byte-identical bytes, independent of map iteration
//!   order in whichever language produced the value.

use {serde::Serialize, thiserror::Error};

#[derive(Debug, Error)]
pub enum EncodeError {
  #[error("binary encoding failed: {0}")]
  Binary(#[from] bincode::Error),

  #[error("json encoding failed: {0}")]
  Json(#[from] serde_json::Error),
}

/// Encodes a value using the canonical binary wire format.
///
/// This is what's stored on disk and sent between peers for
/// everything except sign-bytes.
pub fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
  Ok(bincode::serialize(value)?)
}

pub fn decode_binary<T: serde::de::DeserializeOwned>(
  bytes: &[u8],
) -> Result<T, EncodeError> {
  Ok(bincode::deserialize(bytes)?)
}

/// Encodes a value as canonical JSON with sorted object keys.
///
/// `serde_json`'s `Map` is backed by a `BTreeMap` unless the
/// `preserve_order` feature is enabled (it isn't, here), so key
/// ordering in the output is already alphabetical; this function just
/// names that guarantee so call sites don't have to rediscover it.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
  Ok(serde_json::to_vec(value)?)
}

/// Hex-encodes bytes the way the canonical JSON sign-bytes form
/// expects: uppercase letters, no prefix. Pinned by the S3 test
/// vector (`"70617274735F68617368"` — note the uppercase `F`).
pub fn hex_upper(bytes: &[u8]) -> String {
  bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn canonical_json_sorts_keys() {
    #[derive(Serialize)]
    struct Unsorted {
      z: u8,
      a: u8,
      m: u8,
    }
    let bytes = canonical_json(&Unsorted { z: 1, a: 2, m: 3 }).unwrap();
    assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
  }

  #[test]
  fn hex_upper_matches_s3_vector() {
    assert_eq!(hex_upper(b"hash"), "68617368");
    assert_eq!(hex_upper(b"parts_hash"), "70617274735F68617368");
  }
}
