use crate::error::CacheError;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression as FlateCompression;
use std::io::{Read, Write};

/// Compression level applied to every stored chunk
pub const CHUNK_COMPRESSION_LEVEL: u32 = 5;

/// Deflate codec used for chunk payloads
#[derive(Debug, Clone, Copy)]
pub struct DeflateCompression {
    level: u32,
}

impl DeflateCompression {
    pub fn new() -> Self {
        Self {
            level: CHUNK_COMPRESSION_LEVEL,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(data.len() / 2),
            FlateCompression::new(self.level),
        );
        encoder
            .write_all(data)
            .map_err(|e| CacheError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CacheError::Compression(e.to_string()))
    }

    /// Inflate a payload whose decompressed length is known up front
    pub fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CacheError> {
        let mut decoder = DeflateDecoder::new(data);
        let mut result = Vec::with_capacity(expected_len);
        decoder
            .read_to_end(&mut result)
            .map_err(|e| CacheError::Compression(e.to_string()))?;
        if result.len() != expected_len {
            return Err(CacheError::Compression(format!(
                "inflated {} bytes, expected {}",
                result.len(),
                expected_len
            )));
        }
        Ok(result)
    }
}

impl Default for DeflateCompression {
    fn default() -> Self {
        Self::new()
    }
}
