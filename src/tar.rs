//! A streaming TAR decoder.
//!
//! Bytes are pushed in as they arrive (already gunzipped, see [`gzip`]);
//! entries come out as soon as their header and padded content are buffered.
//! The total stream length is never needed.
//!
//! Header layout (POSIX ustar, offsets in bytes):
//!
//! ```text
//! name       0  100   NUL-terminated
//! size     124   12   octal ASCII (or GNU base-256)
//! typeflag 156    1
//! magic    257    6   "ustar"
//! prefix   345  155   prepended to name when present
//! ```
//!
//! GNU long names (`L`) and PAX `path=` records (`x`) rename the entry that follows them.
//! Global PAX headers (`g`, e.g. `git archive`'s `pax_global_header`)
//! and non-file types are consumed without producing an entry.
//!
//! [`gzip`]: ../gzip/index.html

use log::*;

use crate::arch::{round_up, usize};
use crate::buffer::ByteRingBuffer;
use crate::entry::{ArchiveEntry, CompressionMethod, EntryContent};
use crate::reader::{Decoded, Decoder, DecoderOptions};
use crate::result::*;

pub const BLOCK_LEN: usize = 512;

const NAME: std::ops::Range<usize> = 0..100;
const SIZE: std::ops::Range<usize> = 124..136;
const TYPEFLAG: usize = 156;
const MAGIC: std::ops::Range<usize> = 257..262;
const PREFIX: std::ops::Range<usize> = 345..500;

/// The fields we use from one 512-byte header block.
#[derive(Debug)]
struct Header {
    name: String,
    size: u64,
    typeflag: u8,
}

impl Header {
    fn parse(block: &[u8]) -> Self {
        let name = cstr(&block[NAME]);
        let name = if &block[MAGIC] == b"ustar" && !cstr(&block[PREFIX]).is_empty() {
            let prefix = String::from_utf8_lossy(cstr(&block[PREFIX]));
            let name = String::from_utf8_lossy(name);
            format!("{}/{}", prefix.trim_end_matches('/'), name)
        } else {
            String::from_utf8_lossy(name).into_owned()
        };
        Self {
            name,
            size: parse_size(&block[SIZE]),
            typeflag: block[TYPEFLAG],
        }
    }

    fn is_metadata(&self) -> bool {
        matches!(self.typeflag, b'L' | b'K' | b'x' | b'g')
    }

    fn is_file(&self) -> bool {
        // '7' is a "contiguous file", which everyone treats as a regular one.
        matches!(self.typeflag, 0 | b'0' | b'7')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for (or parsing) a header block.
    Header,
    /// Dropping the remaining content and padding of an entry we didn't buffer.
    Skipping { remaining: u64 },
    Done,
}

pub struct TarDecoder {
    buf: ByteRingBuffer,
    state: State,
    options: DecoderOptions,
    /// From a preceding GNU `L` record
    long_name: Option<String>,
    /// From a preceding PAX `x` record
    pax_path: Option<String>,
}

impl TarDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        Self {
            buf: ByteRingBuffer::new(),
            state: State::Header,
            options,
            long_name: None,
            pax_path: None,
        }
    }

    /// Drops content we've decided not to buffer, as it arrives.
    /// Returns true once all of it is gone.
    fn skip(&mut self, remaining: u64) -> bool {
        let available = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let left = remaining - self.buf.consume(available) as u64;
        self.state = if left == 0 {
            State::Header
        } else {
            State::Skipping { remaining: left }
        };
        left == 0
    }

    fn finish(&mut self) -> Decoded {
        self.state = State::Done;
        self.buf.clear();
        Decoded::End
    }

    /// Parses the next header and, if possible, its entry.
    /// Returns `None` to loop around (metadata records, skipped types).
    fn next_header(&mut self, eof: bool) -> IngestResult<Option<Decoded>> {
        let Some(block) = self.buf.peek(BLOCK_LEN) else {
            if eof {
                if !self.buf.is_empty() {
                    warn!(
                        "TAR stream ended {} bytes into a header at offset {}",
                        self.buf.len(),
                        self.buf.position()
                    );
                }
                return Ok(Some(self.finish()));
            }
            return Ok(Some(Decoded::NeedMore));
        };

        if block.iter().all(|&b| b == 0) {
            debug!("End-of-archive block at offset {}", self.buf.position());
            return Ok(Some(self.finish()));
        }

        let header = Header::parse(block);
        trace!("{:?}", header);
        let padded = round_up(header.size, BLOCK_LEN as u64);

        if header.is_metadata() {
            // Metadata records are small; buffer them whole.
            let needed = usize(padded)?.saturating_add(BLOCK_LEN);
            if self.buf.len() < needed {
                return Ok(Some(self.truncated(eof, &header.name)));
            }
            self.buf.consume(BLOCK_LEN);
            let data = self.buf.take(usize(header.size)?);
            self.buf.consume(usize(padded - header.size)?);
            match header.typeflag {
                b'L' => self.long_name = Some(String::from_utf8_lossy(cstr(&data)).into_owned()),
                b'x' => self.pax_path = pax_path(&data),
                // Global PAX records and GNU long link names don't rename anything we emit.
                _ => trace!("Skipping TAR metadata record {:?}", header.typeflag as char),
            }
            return Ok(None);
        }

        let is_dir = header.typeflag == b'5'
            || self
                .pax_path
                .as_deref()
                .or(self.long_name.as_deref())
                .unwrap_or(&header.name)
                .ends_with('/');

        if !is_dir && !header.is_file() {
            debug!(
                "Skipping TAR entry {} of type {:?}",
                header.name, header.typeflag as char
            );
            self.take_overrides();
            self.buf.consume(BLOCK_LEN);
            self.skip(padded);
            return Ok(None);
        }

        let over_limit = self.options.over_limit(header.size);

        let content = if is_dir {
            self.buf.consume(BLOCK_LEN);
            self.skip(padded);
            EntryContent::empty()
        } else if over_limit {
            debug!(
                "{} is {} bytes, over the buffer limit; skipping its content",
                header.name, header.size
            );
            self.buf.consume(BLOCK_LEN);
            self.skip(padded);
            EntryContent::discarded()
        } else {
            let needed = usize(padded)?.saturating_add(BLOCK_LEN);
            if self.buf.len() < needed {
                return Ok(Some(self.truncated(eof, &header.name)));
            }
            self.buf.consume(BLOCK_LEN);
            let data = self.buf.take(usize(header.size)?);
            self.buf.consume(usize(padded - header.size)?);
            EntryContent::stored(data)
        };

        let path = self.take_overrides().unwrap_or(header.name);
        Ok(Some(Decoded::Entry(ArchiveEntry {
            path,
            is_dir,
            declared_size: Some(header.size),
            compression_method: CompressionMethod::Stored,
            content,
        })))
    }

    /// Either waits for more input, or (at EOF) drops the partial entry and stops.
    fn truncated(&mut self, eof: bool, name: &str) -> Decoded {
        if eof {
            warn!("TAR stream ended inside {name}; dropping it");
            self.finish()
        } else {
            Decoded::NeedMore
        }
    }

    /// Returns the name override for the entry being emitted, clearing both.
    fn take_overrides(&mut self) -> Option<String> {
        let long_name = self.long_name.take();
        self.pax_path.take().or(long_name)
    }
}

impl Decoder for TarDecoder {
    fn feed(&mut self, chunk: &[u8]) -> IngestResult<()> {
        if self.state != State::Done {
            self.buf.push(chunk);
        }
        Ok(())
    }

    fn decode(&mut self, eof: bool) -> IngestResult<Decoded> {
        loop {
            match self.state {
                State::Done => return Ok(Decoded::End),
                State::Skipping { remaining } => {
                    if !self.skip(remaining) {
                        if eof {
                            warn!("TAR stream ended inside skipped content");
                            return Ok(self.finish());
                        }
                        return Ok(Decoded::NeedMore);
                    }
                }
                State::Header => {
                    if let Some(decoded) = self.next_header(eof)? {
                        return Ok(decoded);
                    }
                }
            }
        }
    }
}

/// Returns the bytes of a NUL-terminated field, without the terminator.
fn cstr(field: &[u8]) -> &[u8] {
    match memchr::memchr(0, field) {
        Some(end) => &field[..end],
        None => field,
    }
}

/// Parses the 12-byte size field.
///
/// Octal digits are read one by one until a NUL or space (after any leading spaces);
/// anything that isn't an octal digit is skipped rather than failing the archive.
/// GNU tar stores sizes over 8 GiB as big-endian base-256, flagged by the high bit.
fn parse_size(field: &[u8]) -> u64 {
    if field.first().is_some_and(|&b| b & 0x80 != 0) {
        return field.iter().enumerate().fold(0u64, |acc, (i, &b)| {
            let b = if i == 0 { b & 0x7f } else { b };
            acc.saturating_mul(256).saturating_add(b as u64)
        });
    }

    let mut size = 0u64;
    let digits = field.iter().skip_while(|&&b| b == b' ');
    for &b in digits {
        match b {
            0 | b' ' => break,
            b'0'..=b'7' => size = size.saturating_mul(8).saturating_add((b - b'0') as u64),
            _ => {}
        }
    }
    size
}

/// Pulls the `path` value out of a PAX extended header.
///
/// Records look like `"<len> <key>=<value>\n"`, where `<len>` counts the whole record.
fn pax_path(mut data: &[u8]) -> Option<String> {
    let mut path = None;
    while !data.is_empty() {
        let space = memchr::memchr(b' ', data)?;
        let len: usize = std::str::from_utf8(&data[..space]).ok()?.parse().ok()?;
        if len <= space || len > data.len() {
            break;
        }
        let record = &data[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            path = Some(String::from_utf8_lossy(value).into_owned());
        }
        data = &data[len..];
    }
    path
}
