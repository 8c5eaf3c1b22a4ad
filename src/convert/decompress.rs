//! Layer stream decompression.
//!
//! The compression comes from the media type when one was supplied.
//! Without a media type the leading magic bytes decide.

use crate::error::{Error, Result};
use crate::mediatype::Compression;
use flate2::bufread::GzDecoder;
use std::io::{self, BufRead, BufReader, Read, Write};
use tracing::debug;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Guesses the compression from the first buffered bytes.
fn sniff<B: BufRead>(reader: &mut B) -> io::Result<Compression> {
    let head = reader.fill_buf()?;
    Ok(if head.starts_with(GZIP_MAGIC) {
        Compression::Gzip
    } else if head.starts_with(ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::None
    })
}

/// Copies `source` into `sink`, decompressing per `declared` (or sniffing).
///
/// Returns the number of decompressed bytes written.
pub fn copy_decompressed<R: Read, W: Write>(
    source: &mut R,
    sink: &mut W,
    declared: Option<Compression>,
) -> Result<u64> {
    let mut reader = BufReader::new(source);
    let compression = match declared {
        Some(c) => c,
        None => sniff(&mut reader).map_err(|e| Error::conversion("read layer header", e))?,
    };
    debug!(compression = ?compression, declared = declared.is_some(), "decompressing layer");

    let written = match compression {
        Compression::None => io::copy(&mut reader, &mut *sink),
        Compression::Gzip => io::copy(&mut GzDecoder::new(&mut reader), &mut *sink),
        Compression::Zstd => return Err(Error::UnsupportedCompression("zstd".to_string())),
    }
    .map_err(|e| Error::conversion("decompress layer", e))?;

    sink.flush()
        .map_err(|e| Error::conversion("flush decompressed output", e))?;
    Ok(written)
}
