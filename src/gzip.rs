//! Push-based gunzipping in front of another decoder.
//!
//! `flate2`'s write-side decoder inflates whatever it's handed
//! into a `Vec` we drain after every chunk,
//! so gzip framing that straddles chunk boundaries is its problem, not ours.

use std::io::{self, Write};

use flate2::write::MultiGzDecoder;
use log::*;

use crate::reader::{Decoded, Decoder};
use crate::result::*;

/// gzip magic bytes (RFC 1952)
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Inflates a gzip stream a chunk at a time.
///
/// Concatenated gzip members are treated as one stream.
pub struct GzipInflater {
    decoder: MultiGzDecoder<Vec<u8>>,
}

impl Default for GzipInflater {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipInflater {
    pub fn new() -> Self {
        Self {
            decoder: MultiGzDecoder::new(Vec::new()),
        }
    }

    /// Inflates a compressed chunk,
    /// returning whatever decompressed bytes it produced.
    pub fn push(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        self.decoder.write_all(chunk)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }

    /// Flushes the tail of the stream.
    /// Fails if the stream stopped before its trailer.
    pub fn finish(&mut self) -> io::Result<Vec<u8>> {
        self.decoder.try_finish()?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }
}

/// Wraps another decoder (TAR, in practice), gunzipping its input.
pub struct GzipDecoder<D> {
    inflater: GzipInflater,
    inner: D,
    finished: bool,
}

impl<D> GzipDecoder<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inflater: GzipInflater::new(),
            inner,
            finished: false,
        }
    }
}

impl<D: Decoder> Decoder for GzipDecoder<D> {
    fn feed(&mut self, chunk: &[u8]) -> IngestResult<()> {
        let inflated = self.inflater.push(chunk).map_err(|e| {
            warn!("Couldn't inflate gzip stream: {e}");
            IngestError::InvalidArchive("Corrupt gzip data")
        })?;
        self.inner.feed(&inflated)
    }

    fn decode(&mut self, eof: bool) -> IngestResult<Decoded> {
        if eof && !self.finished {
            self.finished = true;
            match self.inflater.finish() {
                Ok(tail) => self.inner.feed(&tail)?,
                // Same as a truncated TAR: take what we got.
                Err(e) => warn!("gzip stream ended early: {e}"),
            }
        }
        self.inner.decode(eof)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_chunked_inflate() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let compressed = gzip(&data);
        assert_eq!(compressed[..2], GZIP_MAGIC);

        let mut inflater = GzipInflater::new();
        let mut out = Vec::new();
        for chunk in compressed.chunks(7) {
            out.extend(inflater.push(chunk).unwrap());
        }
        out.extend(inflater.finish().unwrap());
        assert_eq!(out, data);
    }

    #[test]
    fn test_truncated_stream() {
        let compressed = gzip(b"hello hello hello");
        let mut inflater = GzipInflater::new();
        inflater.push(&compressed[..compressed.len() - 4]).unwrap();
        assert!(inflater.finish().is_err());
    }

    #[test]
    fn test_garbage_fails() {
        let mut inflater = GzipInflater::new();
        assert!(inflater.push(b"definitely not gzip data, no sir").is_err());
    }
}
