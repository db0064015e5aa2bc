//! Pluggable blob encoding: a binary struct-graph encoder or JSON, each
//! optionally gzip-compressed.
//!
//! Selection happens once per process, read from an env var at startup.
//!
//! The binary encoder "primes" itself on first write of each concrete type:
//! the first blob for a given `type_name` carries an embedded type marker: a
//! length-prefixed name. Every later blob, primed or not, is a self
//! sufficient record — decoding never needs to consult encoder state — which
//! is what lets the ring and the indexer decode historical blobs without the
//! writer's in-memory bookkeeping.

use crate::error::{QueryError, SqlResult};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Binary,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    pub codec: Codec,
    pub gzip: bool,
}

impl Encoding {
    /// Reads `CATTLE_SQL_CACHE_ENCODING`, one of `gob-like`, `json`,
    /// `gob+gzip`, `json+gzip`. Defaults to the compact binary
    /// encoder, uncompressed.
    pub fn from_env() -> Self {
        match std::env::var("CATTLE_SQL_CACHE_ENCODING").as_deref() {
            Ok("json") => Encoding { codec: Codec::Json, gzip: false },
            Ok("json+gzip") => Encoding { codec: Codec::Json, gzip: true },
            Ok("gob+gzip") => Encoding { codec: Codec::Binary, gzip: true },
            _ => Encoding { codec: Codec::Binary, gzip: false },
        }
    }
}

/// Per-process encoder/decoder. One instance is shared by every indexer
/// table; `primed` tracks which type names have already emitted their marker
/// this process lifetime.
pub struct Encoder {
    encoding: Encoding,
    primed: Mutex<HashSet<&'static str>>,
}

impl Encoder {
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding, primed: Mutex::new(HashSet::new()) }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn encode<T: Serialize>(&self, type_name: &'static str, value: &T) -> SqlResult<Vec<u8>> {
        let payload = match self.encoding.codec {
            Codec::Binary => self.encode_binary(type_name, value)?,
            Codec::Json => serde_json::to_vec(value).map_err(|e| QueryError::new("ENCODE json", e.to_string()))?,
        };
        if self.encoding.gzip {
            gzip_compress(&payload)
        } else {
            Ok(payload)
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> SqlResult<T> {
        let payload = if self.encoding.gzip { gzip_decompress(bytes)? } else { bytes.to_vec() };
        match self.encoding.codec {
            Codec::Binary => self.decode_binary(&payload),
            Codec::Json => serde_json::from_slice(&payload).map_err(|e| QueryError::new("DECODE json", e.to_string())),
        }
    }

    fn encode_binary<T: Serialize>(&self, type_name: &'static str, value: &T) -> SqlResult<Vec<u8>> {
        let mut primed = self.primed.lock().expect("encoder mutex poisoned");
        let first_write = primed.insert(type_name);
        let mut out = Vec::new();
        out.push(if first_write { 1u8 } else { 0u8 });
        if first_write {
            let name_bytes = type_name.as_bytes();
            out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(name_bytes);
        }
        let payload = bincode::serialize(value).map_err(|e| QueryError::new("ENCODE binary", e.to_string()))?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn decode_binary<T: DeserializeOwned>(&self, bytes: &[u8]) -> SqlResult<T> {
        if bytes.is_empty() {
            return Err(QueryError::new("DECODE binary", "empty buffer"));
        }
        let mut idx = 1usize;
        let primed_flag = bytes[0];
        if primed_flag == 1 {
            if bytes.len() < idx + 4 {
                return Err(QueryError::new("DECODE binary", "truncated type marker length"));
            }
            let len = u32::from_le_bytes(bytes[idx..idx + 4].try_into().unwrap()) as usize;
            idx += 4;
            if bytes.len() < idx + len {
                return Err(QueryError::new("DECODE binary", "truncated type marker name"));
            }
            idx += len; // the type name itself isn't needed to decode; it's diagnostic only
        }
        bincode::deserialize(&bytes[idx..]).map_err(|e| QueryError::new("DECODE binary", e.to_string()))
    }
}

fn gzip_compress(data: &[u8]) -> SqlResult<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).map_err(|e| QueryError::new("GZIP", e.to_string()))?;
    enc.finish().map_err(|e| QueryError::new("GZIP", e.to_string()))
}

fn gzip_decompress(data: &[u8]) -> SqlResult<Vec<u8>> {
    use flate2::read::GzDecoder;
    let mut dec = GzDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out).map_err(|e| QueryError::new("GUNZIP", e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        tags: Vec<String>,
    }

    fn sample() -> Sample {
        Sample { name: "alpha".into(), tags: vec![] }
    }

    #[test]
    fn binary_round_trip_preserves_empty_vec() {
        let enc = Encoder::new(Encoding { codec: Codec::Binary, gzip: false });
        let bytes = enc.encode("Sample", &sample()).unwrap();
        let back: Sample = enc.decode(&bytes).unwrap();
        assert_eq!(back, sample());
        assert!(back.tags.is_empty(), "empty vec must not become missing/null on decode");
    }

    #[test]
    fn json_round_trip() {
        let enc = Encoder::new(Encoding { codec: Codec::Json, gzip: false });
        let bytes = enc.encode("Sample", &sample()).unwrap();
        let back: Sample = enc.decode(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn gzip_wrapped_round_trip_for_both_codecs() {
        for codec in [Codec::Binary, Codec::Json] {
            let enc = Encoder::new(Encoding { codec, gzip: true });
            let bytes = enc.encode("Sample", &sample()).unwrap();
            let back: Sample = enc.decode(&bytes).unwrap();
            assert_eq!(back, sample());
        }
    }

    #[test]
    fn priming_only_happens_once_but_every_blob_decodes_standalone() {
        let enc = Encoder::new(Encoding { codec: Codec::Binary, gzip: false });
        let first = enc.encode("Sample", &sample()).unwrap();
        let second = enc.encode("Sample", &sample()).unwrap();
        assert_eq!(first[0], 1, "first write of a type primes the marker");
        assert_eq!(second[0], 0, "subsequent writes skip the marker");
        let a: Sample = enc.decode(&first).unwrap();
        let b: Sample = enc.decode(&second).unwrap();
        assert_eq!(a, sample());
        assert_eq!(b, sample());
    }
}
