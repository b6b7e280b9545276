//! Payload Compression
//!
//! Peers negotiate a compression level per direction:
//! - 0: identity
//! - 1..=9: zlib at that level
//! - 10: LZO, single fast pass
//! - 11: LZO, best available pass
//!
//! Compression covers the frame payload only; the sequence number and MAC
//! are added afterwards. A codec failure drops the packet upstream.
//!
//! Levels 10 and 11 share the LZO1X-1 compressor (no lzo1x-999 pass exists
//! in the ecosystem); both decode with the same safe decompressor, so the
//! wire contract is identical.

use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use weft_network::MAXSIZE;

use crate::error::{CoreError, CoreResult};

/// Highest negotiable compression level
pub const MAX_COMPRESSION_LEVEL: u8 = 11;

/// Payload compressor shared by all peer sessions; owns the LZO working
/// memory
pub struct Codec {
    lzo: minilzo_rs::LZO,
}

impl Codec {
    /// Allocate the compressor
    pub fn new() -> CoreResult<Self> {
        let lzo = minilzo_rs::LZO::init()
            .map_err(|e| CoreError::Codec(format!("LZO init failed: {:?}", e)))?;
        Ok(Self { lzo })
    }

    /// Compress `src` at `level` into `dest`
    pub fn compress(&mut self, dest: &mut Vec<u8>, src: &[u8], level: u8) -> CoreResult<()> {
        dest.clear();
        match level {
            0 => {
                dest.extend_from_slice(src);
                Ok(())
            }
            1..=9 => {
                let mut encoder = ZlibEncoder::new(&mut *dest, Compression::new(level as u32));
                encoder
                    .write_all(src)
                    .and_then(|_| encoder.finish().map(|_| ()))
                    .map_err(|e| CoreError::Codec(format!("zlib compression failed: {}", e)))
            }
            10 | 11 => {
                let out = self
                    .lzo
                    .compress(src)
                    .map_err(|e| CoreError::Codec(format!("LZO compression failed: {:?}", e)))?;
                dest.extend_from_slice(&out);
                Ok(())
            }
            _ => Err(CoreError::InvalidCompressionLevel(level)),
        }
    }

    /// Decompress `src` at `level` into `dest`
    pub fn decompress(&mut self, dest: &mut Vec<u8>, src: &[u8], level: u8) -> CoreResult<()> {
        dest.clear();
        match level {
            0 => {
                dest.extend_from_slice(src);
                Ok(())
            }
            1..=9 => {
                let mut decoder = ZlibDecoder::new(&mut *dest);
                decoder
                    .write_all(src)
                    .and_then(|_| decoder.finish().map(|_| ()))
                    .map_err(|e| CoreError::Codec(format!("zlib decompression failed: {}", e)))
            }
            10 | 11 => {
                let out = self
                    .lzo
                    .decompress_safe(src, MAXSIZE)
                    .map_err(|e| CoreError::Codec(format!("LZO decompression failed: {:?}", e)))?;
                dest.extend_from_slice(&out);
                Ok(())
            }
            _ => Err(CoreError::InvalidCompressionLevel(level)),
        }
    }
}
