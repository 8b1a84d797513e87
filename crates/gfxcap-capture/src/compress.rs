//! The compressor seam. Payloads are compressed per block and only kept when
//! the result is strictly smaller than the input.

use std::io::Write;
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use gfxcap_format::CompressionType;

use crate::error::Result;

pub trait Compressor: Send + Sync {
    fn compression_type(&self) -> CompressionType;

    /// Compresses `src` into `dst`, replacing its contents, and returns the
    /// compressed length. A return of 0 means compression failed and the
    /// caller must fall back to the uncompressed payload.
    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> usize;
}

struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zlib
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> usize {
        dst.clear();
        let mut encoder = ZlibEncoder::new(std::mem::take(dst), Compression::default());
        if encoder.write_all(src).is_err() {
            return 0;
        }
        match encoder.finish() {
            Ok(buffer) => {
                let len = buffer.len();
                *dst = buffer;
                len
            }
            Err(_) => 0,
        }
    }
}

/// Instantiates the configured codec; `None` disables compression entirely.
pub fn create_compressor(compression: CompressionType) -> Result<Option<Arc<dyn Compressor>>> {
    match compression {
        CompressionType::None => Ok(None),
        CompressionType::Zlib => Ok(Some(Arc::new(ZlibCompressor))),
    }
}
