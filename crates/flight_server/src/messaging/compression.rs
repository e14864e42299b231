//! Per-connection frame compression.

use crate::connection::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{self, Read, Write};

/// Compresses a frame according to the connection's negotiated mode.
pub fn compress(mode: Compression, frame: &[u8]) -> io::Result<Vec<u8>> {
    match mode {
        Compression::None => Ok(frame.to_vec()),
        Compression::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::with_capacity(frame.len() / 2), flate2::Compression::fast());
            encoder.write_all(frame)?;
            encoder.finish()
        }
    }
}

/// Decompresses a frame, refusing output larger than `limit` bytes.
pub fn decompress(mode: Compression, frame: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    match mode {
        Compression::None => Ok(frame.to_vec()),
        Compression::Deflate => {
            let mut out = Vec::with_capacity(frame.len() * 2);
            DeflateDecoder::new(frame)
                .take(limit as u64 + 1)
                .read_to_end(&mut out)?;
            if out.len() > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("decompressed frame exceeds {limit} bytes"),
                ));
            }
            Ok(out)
        }
    }
}
