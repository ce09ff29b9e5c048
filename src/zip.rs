//! A streaming ZIP decoder, driven by local file headers.
//!
//! A ZIP's authoritative index (the central directory) sits at the back of the file,
//! which is no use when we're handed the archive a chunk at a time
//! and often don't know how long it is.
//! Instead we walk the local file headers that precede each entry's data,
//! the way `unzip -` and friends do, and stop at the central directory.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::borrow::Cow;
use std::convert::TryInto;

use codepage_437::*;
use flate2::{Decompress, FlushDecompress, Status};
use log::*;

use crate::arch::usize;
use crate::buffer::ByteRingBuffer;
use crate::entry::{ArchiveEntry, CompressionMethod, EntryContent};
use crate::reader::{Decoded, Decoder, DecoderOptions};
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// Local file header magic number
pub const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// End of central directory magic number
/// (what an empty archive starts with)
pub const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Data descriptor magic number (optional, but nearly universal)
const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & (1 << 11) != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
fn is_encrypted(flags: u16) -> bool {
    // Bit 0: If set, indicates that the file is encrypted
    flags & 1 != 0
}

/// Extracts the "sizes follow the data" bit from the 16-bit flags field.
fn has_data_descriptor(flags: u16) -> bool {
    // Bit 3: If this bit is set, the fields crc-32, compressed
    //        size and uncompressed size are set to zero in the
    //        local header.  The correct values are put in the
    //        data descriptor immediately following the compressed
    //        data.
    flags & (1 << 3) != 0
}

/// The fixed-size part of a local file header
#[derive(Debug)]
struct LocalFileHeader {
    flags: u16,
    compression_method: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    path_length: usize,
    extra_field_length: usize,
}

impl LocalFileHeader {
    const SIZE: usize = 30;

    fn parse(mut header: &[u8]) -> IngestResult<Self> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        assert_eq!(header[..4], LOCAL_FILE_HEADER_MAGIC);
        header = &header[4..];
        let _minimum_extract_version = read_u16(&mut header);
        let flags = read_u16(&mut header);
        let compression_method = read_u16(&mut header);
        let _last_modified_time = read_u16(&mut header);
        let _last_modified_date = read_u16(&mut header);
        let crc32 = read_u32(&mut header);
        let compressed_size = read_u32(&mut header);
        let uncompressed_size = read_u32(&mut header);
        let path_length = usize(read_u16(&mut header))?;
        let extra_field_length = usize(read_u16(&mut header))?;

        Ok(Self {
            flags,
            compression_method,
            crc32,
            compressed_size,
            uncompressed_size,
            path_length,
            extra_field_length,
        })
    }

    /// The header's full size, including the variable-length fields
    fn total_size(&self) -> usize {
        Self::SIZE + self.path_length + self.extra_field_length
    }

    /// True if the sizes live in a data descriptor after the data
    fn sizes_deferred(&self) -> bool {
        has_data_descriptor(self.flags) && self.compressed_size == 0
    }
}

/// Decodes a file name, falling back to code page 437
/// for pre-UTF-8 archives that didn't set the language encoding flag.
fn decode_path(raw: &[u8], flags: u16) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_owned(),
        Err(_) if is_utf8(flags) => String::from_utf8_lossy(raw).into_owned(),
        Err(_) => {
            let cp437: Cow<str> = Cow::borrow_from_cp437(raw, &CP437_CONTROL);
            cp437.into_owned()
        }
    }
}

/// A DEFLATE entry whose compressed size we'll only learn by inflating it
struct Inflating {
    path: String,
    decompress: Decompress,
    out: Vec<u8>,
    /// Set once the deflate stream ends; we then need the data descriptor.
    ended: bool,
    /// Output went over the buffer limit, so we only inflate to find the end.
    discarding: bool,
}

enum State {
    /// Looking for the next signature
    Scanning,
    /// Dropping the remaining data of an entry we didn't buffer
    Skipping { remaining: u64 },
    Inflating(Box<Inflating>),
    Done,
}

pub struct ZipDecoder {
    buf: ByteRingBuffer,
    state: State,
    options: DecoderOptions,
}

impl ZipDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        Self {
            buf: ByteRingBuffer::new(),
            state: State::Scanning,
            options,
        }
    }

    fn finish(&mut self) -> Decoded {
        self.state = State::Done;
        self.buf.clear();
        Decoded::End
    }

    fn skip(&mut self, remaining: u64) -> bool {
        let available = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let left = remaining - self.buf.consume(available) as u64;
        self.state = if left == 0 {
            State::Scanning
        } else {
            State::Skipping { remaining: left }
        };
        left == 0
    }

    /// Either waits for more input, or (at EOF) drops the partial entry and stops.
    fn truncated(&mut self, eof: bool, path: &str) -> Decoded {
        if eof {
            warn!("ZIP stream ended inside {path}; dropping it");
            self.finish()
        } else {
            Decoded::NeedMore
        }
    }

    /// Looks at the next signature.
    /// Returns `None` to loop around after skipping junk or starting to inflate.
    fn scan(&mut self, eof: bool) -> IngestResult<Option<Decoded>> {
        let Some(mut signature) = self.buf.peek(4) else {
            if eof {
                if !self.buf.is_empty() {
                    debug!("Ignoring {} trailing bytes", self.buf.len());
                }
                return Ok(Some(self.finish()));
            }
            return Ok(Some(Decoded::NeedMore));
        };

        let signature = read_u32(&mut signature).to_le_bytes();
        match signature {
            LOCAL_FILE_HEADER_MAGIC => self.local_file(eof),
            CENTRAL_DIRECTORY_MAGIC | EOCDR_MAGIC | ZIP64_EOCDR_MAGIC => {
                debug!("Reached central directory at offset {}", self.buf.position());
                Ok(Some(self.finish()))
            }
            _ => {
                // Not a header. Skip ahead to the next byte that could start one.
                let skipped = match memchr::memchr(b'P', &self.buf.as_slice()[1..]) {
                    Some(i) => self.buf.consume(i + 1),
                    None => self.buf.consume(self.buf.len()),
                };
                debug!(
                    "Skipped {} unrecognized bytes before offset {}",
                    skipped,
                    self.buf.position()
                );
                Ok(None)
            }
        }
    }

    fn local_file(&mut self, eof: bool) -> IngestResult<Option<Decoded>> {
        let Some(fixed) = self.buf.peek(LocalFileHeader::SIZE) else {
            return Ok(Some(self.truncated(eof, "a local file header")));
        };
        let header = LocalFileHeader::parse(fixed)?;
        trace!("{:?}", header);

        let header_size = header.total_size();
        let Some(raw_path) = self.buf.peek(header_size) else {
            return Ok(Some(self.truncated(eof, "a local file header")));
        };
        let path = decode_path(
            &raw_path[LocalFileHeader::SIZE..LocalFileHeader::SIZE + header.path_length],
            header.flags,
        );
        let is_dir = path.ends_with('/');
        let compression_method = CompressionMethod::from_u16(header.compression_method);

        if header.sizes_deferred() {
            if compression_method == CompressionMethod::Deflate && !is_dir {
                self.buf.consume(header_size);
                self.state = State::Inflating(Box::new(Inflating {
                    path,
                    decompress: Decompress::new(false),
                    out: Vec::new(),
                    ended: false,
                    discarding: false,
                }));
                return Ok(None);
            }
            if !is_dir {
                // Without a size or a self-terminating stream, there's no way to find the end.
                // Whatever follows gets skipped until the next signature.
                warn!("{path} is stored with a data descriptor; emitting it empty");
            }
        }

        let declared_size = (!header.sizes_deferred()).then_some(header.uncompressed_size as u64);
        let compressed_size = header.compressed_size as u64;
        let over_limit = self.options.over_limit(header.uncompressed_size as u64);

        let content = if over_limit && !is_dir {
            debug!(
                "{} is {} bytes, over the buffer limit; skipping its content",
                path, header.uncompressed_size
            );
            self.buf.consume(header_size);
            self.skip(compressed_size);
            EntryContent::discarded()
        } else {
            let needed = header_size.saturating_add(usize(compressed_size)?);
            if self.buf.len() < needed {
                return Ok(Some(self.truncated(eof, &path)));
            }
            self.buf.consume(header_size);
            let data = self.buf.take(usize(compressed_size)?);

            if is_dir {
                EntryContent::empty()
            } else if is_encrypted(header.flags) {
                EntryContent::unreadable(format!("Can't read encrypted file {path}"))
            } else {
                let content = match compression_method {
                    CompressionMethod::Stored => EntryContent::stored(data),
                    CompressionMethod::Deflate => EntryContent::deflated(data),
                    CompressionMethod::Unsupported(m) => {
                        EntryContent::unreadable(format!("Compression method {m} not supported"))
                    }
                };
                if self.options.verify_crc && !header.sizes_deferred() {
                    content.with_crc32(header.crc32)
                } else {
                    content
                }
            }
        };

        Ok(Some(Decoded::Entry(ArchiveEntry {
            path,
            is_dir,
            declared_size,
            compression_method,
            content,
        })))
    }

    /// Inflates a data-descriptor entry as its bytes arrive.
    fn inflate(&mut self, eof: bool) -> IngestResult<Option<Decoded>> {
        let State::Inflating(mut inflating) = std::mem::replace(&mut self.state, State::Scanning)
        else {
            unreachable!("inflate() called outside the Inflating state");
        };

        while !inflating.ended {
            let input = self.buf.as_slice();
            if input.is_empty() {
                return Ok(Some(self.park(inflating, eof)));
            }
            inflating.out.reserve(32 * 1024);
            let before = inflating.decompress.total_in();
            let produced_before = inflating.out.len();
            let status = inflating
                .decompress
                .decompress_vec(input, &mut inflating.out, FlushDecompress::None);
            let used = (inflating.decompress.total_in() - before) as usize;
            let produced = inflating.out.len() - produced_before;
            self.buf.consume(used);

            if inflating.discarding {
                inflating.out.clear();
            } else if self.options.over_limit(inflating.decompress.total_out()) {
                debug!(
                    "{} inflated past the buffer limit; dropping its content",
                    inflating.path
                );
                inflating.discarding = true;
                inflating.out = Vec::new();
            }

            match status {
                Ok(Status::StreamEnd) => inflating.ended = true,
                Ok(_) if used == 0 && produced == 0 => {
                    return Ok(Some(self.park(inflating, eof)));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Corrupt deflate stream in {}: {}", inflating.path, e);
                    // Rescan for the next header from where the inflater gave up.
                    return Ok(Some(Decoded::Entry(ArchiveEntry {
                        path: inflating.path,
                        is_dir: false,
                        declared_size: None,
                        compression_method: CompressionMethod::Deflate,
                        content: EntryContent::unreadable(format!("Corrupt deflate stream: {e}")),
                    })));
                }
            }
        }

        // 4.3.9  Data descriptor:
        //
        //    crc-32                          4 bytes
        //    compressed size                 4 bytes
        //    uncompressed size               4 bytes
        //
        // 4.3.9.3 Although not originally assigned a signature, the value
        // 0x08074b50 has commonly been adopted as a signature value
        // for the data descriptor record.
        let Some(signature) = self.buf.peek(4) else {
            return Ok(Some(self.park(inflating, eof)));
        };
        let offset = if signature == DATA_DESCRIPTOR_MAGIC { 4 } else { 0 };
        let Some(mut descriptor) = self.buf.peek(offset + 12).map(|d| &d[offset..]) else {
            return Ok(Some(self.park(inflating, eof)));
        };
        let crc32 = read_u32(&mut descriptor);
        self.buf.consume(offset + 12);

        Ok(Some(Decoded::Entry(self.inflated_entry(inflating, Some(crc32)))))
    }

    /// Builds the entry for a finished data-descriptor inflate.
    fn inflated_entry(&self, inflating: Box<Inflating>, crc32: Option<u32>) -> ArchiveEntry {
        let (declared_size, content) = if inflating.discarding {
            // Now that we know the size, the filter can reject it for that.
            (Some(inflating.decompress.total_out()), EntryContent::discarded())
        } else {
            let content = EntryContent::inflated(inflating.out.into());
            match crc32 {
                Some(crc32) if self.options.verify_crc => (None, content.with_crc32(crc32)),
                _ => (None, content),
            }
        };
        ArchiveEntry {
            path: inflating.path,
            is_dir: false,
            declared_size,
            compression_method: CompressionMethod::Deflate,
            content,
        }
    }

    /// Puts an in-progress inflate back to wait for more input.
    /// At EOF, the entry is dropped unless only its descriptor is missing.
    fn park(&mut self, inflating: Box<Inflating>, eof: bool) -> Decoded {
        if !eof {
            self.state = State::Inflating(inflating);
            return Decoded::NeedMore;
        }
        if inflating.ended {
            debug!("{} is missing its data descriptor", inflating.path);
            self.finish();
            return Decoded::Entry(self.inflated_entry(inflating, None));
        }
        let path = inflating.path.clone();
        self.truncated(eof, &path)
    }
}

impl Decoder for ZipDecoder {
    fn feed(&mut self, chunk: &[u8]) -> IngestResult<()> {
        if !matches!(self.state, State::Done) {
            self.buf.push(chunk);
        }
        Ok(())
    }

    fn decode(&mut self, eof: bool) -> IngestResult<Decoded> {
        loop {
            let step = match self.state {
                State::Done => return Ok(Decoded::End),
                State::Skipping { remaining } => {
                    if self.skip(remaining) {
                        None
                    } else if eof {
                        warn!("ZIP stream ended inside skipped content");
                        Some(self.finish())
                    } else {
                        Some(Decoded::NeedMore)
                    }
                }
                State::Inflating(_) => self.inflate(eof)?,
                State::Scanning => self.scan(eof)?,
            };
            if let Some(decoded) = step {
                return Ok(decoded);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn local_file(path: &str, method: u16, flags: u16, data: &[u8], sizes: Option<(u32, u32)>) -> Vec<u8> {
        let (compressed, uncompressed) = sizes.unwrap_or((data.len() as u32, data.len() as u32));
        let mut out = LOCAL_FILE_HEADER_MAGIC.to_vec();
        out.extend(20u16.to_le_bytes());
        out.extend(flags.to_le_bytes());
        out.extend(method.to_le_bytes());
        out.extend([0u8; 4]); // time, date
        out.extend(crc32fast::hash(data).to_le_bytes());
        out.extend(compressed.to_le_bytes());
        out.extend(uncompressed.to_le_bytes());
        out.extend((path.len() as u16).to_le_bytes());
        out.extend(0u16.to_le_bytes());
        out.extend(path.as_bytes());
        out.extend(data);
        out
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn decode_all(bytes: &[u8], options: DecoderOptions) -> Vec<ArchiveEntry> {
        let mut decoder = ZipDecoder::new(options);
        decoder.feed(bytes).unwrap();
        let mut entries = Vec::new();
        while let Decoded::Entry(e) = decoder.decode(true).unwrap() {
            entries.push(e);
        }
        entries
    }

    #[test]
    fn test_stops_at_central_directory() {
        let mut archive = local_file("a.txt", 0, 0, b"hello", None);
        archive.extend(CENTRAL_DIRECTORY_MAGIC);
        archive.extend([0u8; 42]);
        // Anything after the central directory is never looked at.
        archive.extend(local_file("b.txt", 0, 0, b"nope", None));

        let entries = decode_all(&archive, DecoderOptions::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "a.txt");
    }

    #[test]
    fn test_skips_junk_between_entries() {
        let mut archive = b"junk with a P in it".to_vec();
        archive.extend(local_file("a.txt", 0, 0, b"hello", None));
        archive.extend(b"PK\x09\x09more junk");
        archive.extend(local_file("b.txt", 0, 0, b"world", None));

        let entries = decode_all(&archive, DecoderOptions::default());
        let names: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
    }

    #[test]
    fn test_deflate_and_unsupported_methods() {
        let compressed = deflate(b"console.log(1)");
        let mut archive = local_file(
            "dir/b.js",
            8,
            0,
            &compressed,
            Some((compressed.len() as u32, 14)),
        );
        archive.extend(local_file("c.bz2", 12, 0, b"whatever", None));

        let mut entries = decode_all(&archive, DecoderOptions::default()).into_iter();
        let js = entries.next().unwrap();
        assert_eq!(js.compression_method, CompressionMethod::Deflate);
        assert_eq!(js.declared_size, Some(14));
        assert_eq!(&js.content.read_all().unwrap()[..], b"console.log(1)");

        let bz = entries.next().unwrap();
        assert_eq!(bz.compression_method, CompressionMethod::Unsupported(12));
        assert!(bz.content.read_all().is_err());
    }

    #[test]
    fn test_data_descriptor_inflation() {
        let compressed = deflate(b"streamed without sizes");
        let mut archive = local_file("s.txt", 8, 1 << 3, &compressed, Some((0, 0)));
        archive.extend(DATA_DESCRIPTOR_MAGIC);
        archive.extend(crc32fast::hash(b"streamed without sizes").to_le_bytes());
        archive.extend((compressed.len() as u32).to_le_bytes());
        archive.extend(22u32.to_le_bytes());
        archive.extend(local_file("after.txt", 0, 0, b"after", None));

        let options = DecoderOptions {
            verify_crc: true,
            ..Default::default()
        };
        // Feed a byte at a time to exercise the incremental inflater.
        let mut decoder = ZipDecoder::new(options);
        let mut entries = Vec::new();
        for byte in &archive {
            decoder.feed(std::slice::from_ref(byte)).unwrap();
            while let Decoded::Entry(e) = decoder.decode(false).unwrap() {
                entries.push(e);
            }
        }
        while let Decoded::Entry(e) = decoder.decode(true).unwrap() {
            entries.push(e);
        }

        let names: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert_eq!(names, ["s.txt", "after.txt"]);
        let mut entries = entries.into_iter();
        let streamed = entries.next().unwrap();
        assert_eq!(streamed.declared_size, None);
        assert_eq!(&streamed.content.read_all().unwrap()[..], b"streamed without sizes");
    }

    #[test]
    fn test_data_descriptor_over_buffer_limit() {
        let zeros = vec![0u8; 8 * 1024 * 1024];
        let compressed = deflate(&zeros);
        assert!(compressed.len() < 64 * 1024);
        let mut archive = local_file("zeros.bin", 8, 1 << 3, &compressed, Some((0, 0)));
        archive.extend(DATA_DESCRIPTOR_MAGIC);
        archive.extend(crc32fast::hash(&zeros).to_le_bytes());
        archive.extend((compressed.len() as u32).to_le_bytes());
        archive.extend((zeros.len() as u32).to_le_bytes());
        archive.extend(local_file("after.txt", 0, 0, b"after", None));

        let options = DecoderOptions {
            buffer_limit: Some(1000),
            ..Default::default()
        };
        let mut decoder = ZipDecoder::new(options);
        let mut entries = Vec::new();
        for chunk in archive.chunks(1024) {
            decoder.feed(chunk).unwrap();
            while let Decoded::Entry(e) = decoder.decode(false).unwrap() {
                entries.push(e);
            }
            // Never more than the limit plus one inflate step.
            if let State::Inflating(inflating) = &decoder.state {
                assert!(inflating.out.capacity() <= 64 * 1024);
            }
        }
        while let Decoded::Entry(e) = decoder.decode(true).unwrap() {
            entries.push(e);
        }

        let names: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert_eq!(names, ["zeros.bin", "after.txt"]);
        let mut entries = entries.into_iter();
        let zeros_entry = entries.next().unwrap();
        assert_eq!(zeros_entry.declared_size, Some(8 * 1024 * 1024));
        assert!(!zeros_entry.content.is_available());
        assert_eq!(&entries.next().unwrap().content.read_all().unwrap()[..], b"after");
    }

    #[test]
    fn test_cp437_names() {
        // 0x81 is 'ü' in code page 437 and invalid as a lone UTF-8 byte.
        assert_eq!(decode_path(b"gr\x81n.txt", 0), "grün.txt");
        assert_eq!(decode_path("grün.txt".as_bytes(), 1 << 11), "grün.txt");
    }

    #[test]
    fn test_buffer_limit_skips_content() {
        let mut archive = local_file("big.bin", 0, 0, &[1u8; 2000], None);
        archive.extend(local_file("small.txt", 0, 0, b"ok", None));

        let options = DecoderOptions {
            buffer_limit: Some(1000),
            ..Default::default()
        };
        let mut entries = decode_all(&archive, options).into_iter();
        let big = entries.next().unwrap();
        assert_eq!(big.declared_size, Some(2000));
        assert!(!big.content.is_available());
        assert_eq!(entries.next().unwrap().path, "small.txt");
    }
}
