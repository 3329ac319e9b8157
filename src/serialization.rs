//! Value encoding and the transform envelope.
//!
//! Values are encoded with a [`Codec`] (JSON unless configured otherwise).
//! When data transformers rewrote a payload on its way into the cache, the
//! stored bytes carry an envelope naming those transformers so reads can
//! undo them in reverse order.
//!
//! # Envelope format
//!
//! ```text
//! [MAGIC: 4 bytes "CENV"] [COUNT: 1 byte] ([LEN: 1 byte] [NAME])* [PAYLOAD]
//! ```
//!
//! Payloads that no transformer touched are stored bare.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic header marking a transform envelope.
pub const ENVELOPE_MAGIC: &[u8; 4] = b"CENV";

/// Any type the engine can hold in the cache.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Encoding used for stored values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Codec {
    /// `serde_json`, human readable and interoperable.
    #[default]
    Json,

    /// `postcard`, compact binary. Not self-describing: only usable for
    /// concrete types, never `serde_json::Value`.
    Postcard,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Json => {
                serde_json::to_vec(value).map_err(|e| Error::SerializationError(e.to_string()))
            }
            Codec::Postcard => postcard::to_allocvec(value)
                .map_err(|e| Error::SerializationError(e.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::Json => serde_json::from_slice(bytes)
                .map_err(|e| Error::DeserializationError(e.to_string())),
            Codec::Postcard => postcard::from_bytes(bytes)
                .map_err(|e| Error::DeserializationError(e.to_string())),
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "postcard" => Ok(Codec::Postcard),
            other => Err(Error::ConfigError(format!("Unknown codec: {}", other))),
        }
    }
}

/// Wrap a transformed payload with the names of the transformers applied.
pub fn wrap_envelope(applied: &[String], payload: Vec<u8>) -> Result<Vec<u8>> {
    if applied.is_empty() {
        return Ok(payload);
    }
    if applied.len() > u8::MAX as usize {
        return Err(Error::SerializationError(format!(
            "Too many transformers in envelope: {}",
            applied.len()
        )));
    }

    let header_len: usize = applied.iter().map(|n| n.len() + 1).sum();
    let mut out = Vec::with_capacity(ENVELOPE_MAGIC.len() + 1 + header_len + payload.len());
    out.extend_from_slice(ENVELOPE_MAGIC);
    out.push(applied.len() as u8);
    for name in applied {
        let bytes = name.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(Error::SerializationError(format!(
                "Transformer name too long: {}",
                name
            )));
        }
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Split stored bytes into the applied transformer names and the payload.
///
/// Bare payloads come back with an empty name list.
pub fn unwrap_envelope(bytes: &[u8]) -> Result<(Vec<String>, &[u8])> {
    if bytes.len() < ENVELOPE_MAGIC.len() + 1 || &bytes[..4] != ENVELOPE_MAGIC {
        return Ok((Vec::new(), bytes));
    }

    let count = bytes[4] as usize;
    let mut pos = 5;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        let len = *bytes.get(pos).ok_or_else(|| {
            Error::DeserializationError("Truncated transform envelope".to_string())
        })? as usize;
        pos += 1;
        let raw = bytes.get(pos..pos + len).ok_or_else(|| {
            Error::DeserializationError("Truncated transformer name".to_string())
        })?;
        let name = std::str::from_utf8(raw)
            .map_err(|e| Error::DeserializationError(e.to_string()))?;
        names.push(name.to_string());
        pos += len;
    }

    Ok((names, &bytes[pos..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u32,
        name: String,
    }

    #[test]
    fn test_json_is_default() {
        let codec = Codec::default();
        let bytes = codec
            .encode(&Profile {
                id: 1,
                name: "ada".into(),
            })
            .expect("encode");
        assert_eq!(bytes, br#"{"id":1,"name":"ada"}"#.to_vec());
    }

    #[test]
    fn test_malformed_data_is_deserialization_error() {
        let err = Codec::Json
            .decode::<Profile>(b"not json")
            .expect_err("should fail");
        assert!(matches!(err, Error::DeserializationError(_)));
    }

    #[test]
    fn test_postcard_codec() {
        let value = Profile {
            id: 7,
            name: "grace".into(),
        };
        let bytes = Codec::Postcard.encode(&value).expect("encode");
        assert_eq!(Codec::Postcard.decode::<Profile>(&bytes).expect("decode"), value);
    }

    #[test]
    fn test_bare_payload_passes_through() {
        let (names, payload) = unwrap_envelope(b"{\"a\":1}").expect("unwrap");
        assert!(names.is_empty());
        assert_eq!(payload, b"{\"a\":1}");
    }

    #[test]
    fn test_envelope_records_transformers() {
        let applied = vec!["compression".to_string(), "encryption".to_string()];
        let wrapped = wrap_envelope(&applied, b"payload".to_vec()).expect("wrap");
        assert!(wrapped.starts_with(ENVELOPE_MAGIC));

        let (names, payload) = unwrap_envelope(&wrapped).expect("unwrap");
        assert_eq!(names, applied);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_truncated_envelope_is_rejected() {
        let bytes = [b'C', b'E', b'N', b'V', 2, 10, b'x'];
        assert!(matches!(
            unwrap_envelope(&bytes),
            Err(Error::DeserializationError(_))
        ));
    }
}
