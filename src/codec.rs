//! Argument codec.
//!
//! Handler arguments travel as a self-describing sequence of tagged values
//! so a consumer can rebuild typed positional args without out-of-band
//! schema. Two wire formats are supported: MessagePack (default, compact)
//! and JSON (debuggable). Whole-body gzip compression is applied after
//! encoding; the flag is carried on the message, never inside the body.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A single handler argument.
///
/// Sequences are homogeneous by convention; the codec does not enforce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Timestamp(u64),
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// Short tag for error messages.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ArgValue::Bool(_) => "bool",
            ArgValue::Int(_) => "int",
            ArgValue::Uint(_) => "uint",
            ArgValue::Float(_) => "float",
            ArgValue::Str(_) => "str",
            ArgValue::Bytes(_) => "bytes",
            ArgValue::Timestamp(_) => "timestamp",
            ArgValue::List(_) => "list",
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        ArgValue::Int(v as i64)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        ArgValue::Uint(v as u64)
    }
}

impl From<u64> for ArgValue {
    fn from(v: u64) -> Self {
        ArgValue::Uint(v)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl From<Vec<u8>> for ArgValue {
    fn from(v: Vec<u8>) -> Self {
        ArgValue::Bytes(v)
    }
}

impl ArgValue {
    /// Build a homogeneous sequence argument.
    pub fn list<T: Into<ArgValue>>(items: impl IntoIterator<Item = T>) -> Self {
        ArgValue::List(items.into_iter().map(Into::into).collect())
    }
}

/// Wire format for the encoded argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    MessagePack,
    Json,
}

impl Codec {
    pub fn encode(&self, args: &[ArgValue]) -> Result<Vec<u8>, Error> {
        match self {
            Codec::MessagePack => {
                rmp_serde::to_vec(args).map_err(|e| Error::Codec(e.to_string()))
            }
            Codec::Json => serde_json::to_vec(args).map_err(|e| Error::Codec(e.to_string())),
        }
    }

    pub fn decode(&self, body: &[u8]) -> Result<Vec<ArgValue>, Error> {
        match self {
            Codec::MessagePack => {
                rmp_serde::from_slice(body).map_err(|e| Error::Codec(e.to_string()))
            }
            Codec::Json => serde_json::from_slice(body).map_err(|e| Error::Codec(e.to_string())),
        }
    }
}

pub(crate) fn compress(body: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Codec(e.to_string()))
}

pub(crate) fn decompress(body: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| Error::Codec(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_args() -> Vec<ArgValue> {
        vec![
            "hello".into(),
            42i64.into(),
            7u64.into(),
            1.5f64.into(),
            true.into(),
            vec![1u8, 2, 3].into(),
            ArgValue::Timestamp(1_700_000_000_000),
            ArgValue::List(vec!["a".into(), "b".into()]),
        ]
    }

    #[test]
    fn roundtrip_messagepack() {
        let args = sample_args();
        let body = Codec::MessagePack.encode(&args).unwrap();
        assert_eq!(Codec::MessagePack.decode(&body).unwrap(), args);
    }

    #[test]
    fn roundtrip_json() {
        let args = sample_args();
        let body = Codec::Json.encode(&args).unwrap();
        assert_eq!(Codec::Json.decode(&body).unwrap(), args);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Codec::MessagePack.decode(b"\xff\xff\xff").unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn compression_roundtrip() {
        let body = Codec::MessagePack.encode(&sample_args()).unwrap();
        let packed = compress(&body).unwrap();
        assert_ne!(packed, body);
        assert_eq!(decompress(&packed).unwrap(), body);
    }
}
