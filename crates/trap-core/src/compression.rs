//! Payload compression
//!
//! Stateless zlib deflate/inflate applied to message payloads only. Whether
//! a payload is compressed is decided by the message flag, never by content.

use bytes::Bytes;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;

use crate::{Error, Result};

/// Deflate a payload
pub fn deflate(data: &[u8]) -> Result<Bytes> {
    let mut encoder = ZlibEncoder::new(data, Compression::default());
    let mut compressed = Vec::with_capacity(data.len() / 2 + 16);
    encoder
        .read_to_end(&mut compressed)
        .map_err(|e| Error::Compression(e.to_string()))?;
    Ok(Bytes::from(compressed))
}

/// Inflate a payload produced by [`deflate`]
pub fn inflate(data: &[u8]) -> Result<Bytes> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(Bytes::from(decompressed))
}
