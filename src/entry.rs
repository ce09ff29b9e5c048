//! Entries yielded by the archive decoders.

use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;
use flate2::read::DeflateDecoder;
use log::*;

use crate::crc_reader::Crc32Reader;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed.
    /// (TAR entries are always stored; gzip is handled around the whole stream.)
    Stored,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

impl CompressionMethod {
    pub(crate) fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }
}

/// One file or directory from a source archive.
///
/// The decoder hands these out in archive order.
/// Since the decoder only moves on once the caller asks for the next entry,
/// at most one entry's content is ever held at a time.
#[derive(Debug)]
pub struct ArchiveEntry {
    /// The raw, archive-relative path, including any leading
    /// top-level folder. Never percent-decoded or normalized.
    pub path: String,

    pub is_dir: bool,

    /// Size from the entry's header, if it gave one.
    /// (ZIP entries using data descriptors don't.)
    pub declared_size: Option<u64>,

    pub compression_method: CompressionMethod,

    /// The entry's data, not yet decompressed.
    pub content: EntryContent,
}

impl ArchiveEntry {
    pub fn is_file(&self) -> bool {
        !self.is_dir
    }
}

/// The (possibly compressed) data of an entry.
///
/// Decompression happens when the content is read.
/// Consumers that don't need it should [`cancel`](Self::cancel) it,
/// which drops the buffered bytes without inflating them.
pub struct EntryContent {
    repr: Repr,
    /// Expected CRC-32, present only when verification was requested.
    crc32: Option<u32>,
}

enum Repr {
    Empty,
    Stored(Bytes),
    Deflated(Bytes),
    /// Already inflated by the decoder (ZIP entries with data descriptors).
    Inflated(Bytes),
    /// The decoder skipped the bytes without buffering them.
    Discarded,
    /// Reading fails with the given message.
    Unreadable(String),
}

impl EntryContent {
    pub fn empty() -> Self {
        Self::new(Repr::Empty)
    }

    pub(crate) fn stored(data: Bytes) -> Self {
        Self::new(Repr::Stored(data))
    }

    pub(crate) fn deflated(data: Bytes) -> Self {
        Self::new(Repr::Deflated(data))
    }

    pub(crate) fn inflated(data: Bytes) -> Self {
        Self::new(Repr::Inflated(data))
    }

    pub(crate) fn discarded() -> Self {
        Self::new(Repr::Discarded)
    }

    pub(crate) fn unreadable(why: String) -> Self {
        Self::new(Repr::Unreadable(why))
    }

    fn new(repr: Repr) -> Self {
        Self { repr, crc32: None }
    }

    pub(crate) fn with_crc32(mut self, crc32: u32) -> Self {
        self.crc32 = Some(crc32);
        self
    }

    /// False if the decoder skipped this entry's bytes
    /// (because it was larger than the buffer limit).
    pub fn is_available(&self) -> bool {
        !matches!(self.repr, Repr::Discarded)
    }

    /// Number of bytes held for this entry (compressed, if it's compressed).
    pub fn buffered_len(&self) -> usize {
        match &self.repr {
            Repr::Stored(b) | Repr::Deflated(b) | Repr::Inflated(b) => b.len(),
            _ => 0,
        }
    }

    /// Returns a reader that decompresses (and optionally checks) the content.
    pub fn reader(self) -> io::Result<Box<dyn Read + Send>> {
        let crc32 = self.crc32;
        match self.repr {
            Repr::Empty => Ok(checked(io::empty(), crc32)),
            Repr::Stored(data) | Repr::Inflated(data) => {
                Ok(checked(io::Cursor::new(data), crc32))
            }
            Repr::Deflated(data) => Ok(checked(DeflateDecoder::new(io::Cursor::new(data)), crc32)),
            Repr::Discarded => Err(io::Error::other(
                "Entry content was skipped without buffering",
            )),
            Repr::Unreadable(why) => Err(io::Error::new(io::ErrorKind::Unsupported, why)),
        }
    }

    /// Reads the whole content into memory.
    ///
    /// Stored content is handed back without copying
    /// unless it needs a checksum pass.
    pub fn read_all(self) -> io::Result<Bytes> {
        match (self.repr, self.crc32) {
            (Repr::Empty, None) => Ok(Bytes::new()),
            (Repr::Stored(data) | Repr::Inflated(data), None) => Ok(data),
            (repr, crc32) => {
                let mut out = Vec::new();
                Self { repr, crc32 }.reader()?.read_to_end(&mut out)?;
                Ok(Bytes::from(out))
            }
        }
    }

    /// Drops the content without decompressing it.
    pub fn cancel(self) {
        trace!("Cancelling {:?}", self);
    }
}

impl fmt::Debug for EntryContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, len) = match &self.repr {
            Repr::Empty => ("empty", 0),
            Repr::Stored(b) => ("stored", b.len()),
            Repr::Deflated(b) => ("deflated", b.len()),
            Repr::Inflated(b) => ("inflated", b.len()),
            Repr::Discarded => ("discarded", 0),
            Repr::Unreadable(_) => ("unreadable", 0),
        };
        f.debug_struct("EntryContent")
            .field("kind", &kind)
            .field("buffered", &len)
            .field("crc32", &self.crc32)
            .finish()
    }
}

/// Wraps a content reader in a CRC check if we were given a CRC to check.
fn checked<'a, R: Read + Send + 'a>(reader: R, crc32: Option<u32>) -> Box<dyn Read + Send + 'a> {
    match crc32 {
        Some(crc) => Box::new(Crc32Reader::new(reader, crc)),
        None => Box::new(reader),
    }
}
