//! Turning a byte source into a sequence of archive entries
//!
//! Decoders are push-based: we [`feed`](Decoder::feed) them whatever chunks
//! arrive and [`decode`](Decoder::decode) until they want more.
//! They never do I/O themselves, which keeps them synchronous
//! and lets the same decoder run over a file, a socket, or a test vector.
//! [`ArchiveReader`] is the async glue between the two.

use log::*;

use crate::detect::ArchiveFormat;
use crate::entry::ArchiveEntry;
use crate::result::*;
use crate::source::ByteSource;

/// Options for the archive decoders
#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderOptions {
    /// Check each ZIP entry's CRC-32 when its content is read.
    pub verify_crc: bool,

    /// Entries whose declared size exceeds this are emitted without content,
    /// and their bytes are skipped as they stream past instead of buffered.
    pub buffer_limit: Option<u64>,
}

impl DecoderOptions {
    pub(crate) fn over_limit(&self, size: u64) -> bool {
        self.buffer_limit.is_some_and(|limit| size > limit)
    }
}

/// What a decoder produced from the input it's been fed so far
#[derive(Debug)]
pub enum Decoded {
    Entry(ArchiveEntry),
    /// Feed more input (or pass `eof = true` if there is none).
    NeedMore,
    /// The archive is over. Any further input is ignored.
    End,
}

/// A push-based, incremental archive parser
pub trait Decoder: Send {
    /// Appends a chunk of input.
    fn feed(&mut self, chunk: &[u8]) -> IngestResult<()>;

    /// Tries to produce the next entry from buffered input.
    ///
    /// `eof` says that no more input is coming,
    /// so a partial structure is truncation rather than something to wait on.
    /// With `eof` set, decoders never return [`Decoded::NeedMore`].
    fn decode(&mut self, eof: bool) -> IngestResult<Decoded>;
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn feed(&mut self, chunk: &[u8]) -> IngestResult<()> {
        (**self).feed(chunk)
    }

    fn decode(&mut self, eof: bool) -> IngestResult<Decoded> {
        (**self).decode(eof)
    }
}

/// Pulls chunks from a source through a decoder, one entry at a time.
///
/// Nothing is read from the source until the caller asks for the next entry,
/// so a slow consumer throttles how fast we read.
pub struct ArchiveReader<S> {
    source: S,
    decoder: Box<dyn Decoder>,
    eof: bool,
    bytes_read: u64,
}

impl<S: ByteSource> ArchiveReader<S> {
    pub fn new(source: S, format: ArchiveFormat, options: DecoderOptions) -> Self {
        Self::with_decoder(source, format.decoder(options))
    }

    pub fn with_decoder(source: S, decoder: Box<dyn Decoder>) -> Self {
        Self {
            source,
            decoder,
            eof: false,
            bytes_read: 0,
        }
    }

    /// Returns the next entry, or `None` once the archive ends.
    ///
    /// Errors reading the source are fatal.
    pub async fn next_entry(&mut self) -> IngestResult<Option<ArchiveEntry>> {
        loop {
            match self.decoder.decode(self.eof)? {
                Decoded::Entry(entry) => {
                    trace!("Decoded {:?}", entry);
                    return Ok(Some(entry));
                }
                Decoded::End => return Ok(None),
                Decoded::NeedMore if self.eof => {
                    // Decoders shouldn't do this; don't spin if one does.
                    warn!("Decoder wanted more input after the end of the stream");
                    return Ok(None);
                }
                Decoded::NeedMore => match self.source.next_chunk().await? {
                    Some(chunk) => {
                        self.bytes_read += chunk.len() as u64;
                        self.decoder.feed(&chunk)?;
                    }
                    None => {
                        debug!("Source ended after {} bytes", self.bytes_read);
                        self.eof = true;
                    }
                },
            }
        }
    }

    /// Bytes pulled from the source so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Gives back the source, positioned wherever the decoder left it.
    pub fn into_source(self) -> S {
        self.source
    }
}
