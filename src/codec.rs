//! Value serialization for the distributed tier.
//!
//! Values are serialized with `serde_json`, gzip-compressed above a
//! configured threshold, and framed in a compact msgpack envelope that
//! carries the compression flag, the stored TTL, and the creation timestamp.
//! The codec is content-agnostic: it round-trips any `serde_json::Value`,
//! including strings carrying binary payloads.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Envelope version; bumped on incompatible wire changes.
const WIRE_VERSION: u8 = 1;

/// The on-the-wire record stored in the remote backend.
#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    version: u8,
    compressed: bool,
    created_at: u64,
    ttl_secs: u64,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// An encoded value ready for the remote backend.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Serializer/deserializer with transparent compression.
#[derive(Debug, Clone)]
pub struct ValueCodec {
    compression_enabled: bool,
    compression_threshold: usize,
}

impl ValueCodec {
    #[must_use]
    pub fn new(compression_enabled: bool, compression_threshold: usize) -> Self {
        Self {
            compression_enabled,
            compression_threshold,
        }
    }

    /// Serialize a value, compressing when the payload crosses the threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    pub fn encode(&self, value: &Value, ttl: Duration) -> Result<Encoded> {
        let raw = serde_json::to_vec(value).context("failed to serialize cache value")?;

        let (payload, compressed) =
            if self.compression_enabled && raw.len() > self.compression_threshold {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&raw)
                    .context("failed to compress cache value")?;
                (
                    encoder.finish().context("failed to finish compression")?,
                    true,
                )
            } else {
                (raw, false)
            };

        let record = WireRecord {
            version: WIRE_VERSION,
            compressed,
            created_at: unix_now_secs(),
            ttl_secs: ttl.as_secs(),
            payload,
        };

        let bytes = rmp_serde::to_vec(&record).context("failed to frame cache record")?;
        Ok(Encoded { bytes, compressed })
    }

    /// Deserialize a wire record back into a value.
    ///
    /// # Errors
    ///
    /// Returns an error on an unknown envelope version or a corrupt payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let record: WireRecord =
            rmp_serde::from_slice(bytes).context("failed to parse cache record frame")?;

        if record.version != WIRE_VERSION {
            anyhow::bail!("unsupported cache record version: {}", record.version);
        }

        let raw = if record.compressed {
            let mut decoder = GzDecoder::new(record.payload.as_slice());
            let mut buf = Vec::new();
            decoder
                .read_to_end(&mut buf)
                .context("failed to decompress cache value")?;
            buf
        } else {
            record.payload
        };

        serde_json::from_slice(&raw).context("failed to deserialize cache value")
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn small_values_stay_uncompressed() {
        let codec = ValueCodec::new(true, 1024);
        let value = json!({"user": "alice", "score": 100});

        let encoded = codec.encode(&value, Duration::from_secs(60)).unwrap();
        assert!(!encoded.compressed);
        assert_eq!(codec.decode(&encoded.bytes).unwrap(), value);
    }

    #[test]
    fn large_values_are_compressed() {
        let codec = ValueCodec::new(true, 128);
        let value = json!({"blob": "x".repeat(4096)});

        let encoded = codec.encode(&value, Duration::from_secs(60)).unwrap();
        assert!(encoded.compressed);
        // Highly repetitive content shrinks well below the raw size.
        assert!(encoded.bytes.len() < 4096);
        assert_eq!(codec.decode(&encoded.bytes).unwrap(), value);
    }

    #[test]
    fn compression_disabled_is_respected() {
        let codec = ValueCodec::new(false, 16);
        let value = json!({"blob": "y".repeat(1024)});

        let encoded = codec.encode(&value, Duration::from_secs(60)).unwrap();
        assert!(!encoded.compressed);
        assert_eq!(codec.decode(&encoded.bytes).unwrap(), value);
    }

    #[test]
    fn round_trips_arbitrary_shapes() {
        let codec = ValueCodec::new(true, 64);
        let values = [
            Value::Null,
            json!(true),
            json!(-12.5),
            json!("plain"),
            json!([1, 2, 3, [4, 5]]),
            json!({"nested": {"deep": {"binary-ish": "\u{0}\u{1}\u{2}"}}}),
        ];
        for value in values {
            let encoded = codec.encode(&value, Duration::from_secs(1)).unwrap();
            assert_eq!(codec.decode(&encoded.bytes).unwrap(), value);
        }
    }

    #[test]
    fn corrupt_frames_are_rejected() {
        let codec = ValueCodec::new(true, 64);
        assert!(codec.decode(b"definitely not msgpack").is_err());
    }
}
