// src/codec.rs - payload encoding with optional compression
use crate::{QueuifyError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};

/// Marker prefix for compressed payloads. A JSON document can never begin
/// with these bytes, so presence of the prefix is a reliable signal.
pub const COMPRESSED_PREFIX: &[u8] = b"lzc";

/// Serializes a payload for storage, compressing it behind the `lzc`
/// marker when the owning queue has compression enabled.
pub fn encode_payload(value: &Value, compress: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if !compress {
        return Ok(json);
    }
    let mut encoder = ZlibEncoder::new(Vec::from(COMPRESSED_PREFIX), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Deserializes a stored payload, transparently inflating it when the
/// compression marker is present.
pub fn decode_payload(bytes: &[u8]) -> Result<Value> {
    if let Some(compressed) = bytes.strip_prefix(COMPRESSED_PREFIX) {
        let mut json = Vec::new();
        ZlibDecoder::new(compressed)
            .read_to_end(&mut json)
            .map_err(|e| QueuifyError::InvalidPayload(format!("corrupt compressed payload: {e}")))?;
        return Ok(serde_json::from_slice(&json)?);
    }
    Ok(serde_json::from_slice(bytes)?)
}
