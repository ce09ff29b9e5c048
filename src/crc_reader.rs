//! CRC-32 checking for ZIP entry content.
//!
//! ZIP local headers carry the CRC-32 of the uncompressed data.
//! We don't check it unless asked to (see `DecoderOptions::verify_crc`),
//! in which case entry readers get wrapped in a `Crc32Reader`.

use std::io;
use std::io::prelude::*;

use crc32fast::Hasher;

/// Reader that fails at EOF if the bytes it passed along
/// don't hash to the expected CRC-32.
pub struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    expected: u32,
}

impl<R> Crc32Reader<R> {
    pub fn new(inner: R, expected: u32) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            expected,
        }
    }

    fn matches(&self) -> bool {
        self.hasher.clone().finalize() == self.expected
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        if count == 0 && !buf.is_empty() && !self.matches() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Invalid checksum: expected {:08x}, got {:08x}",
                    self.expected,
                    self.hasher.clone().finalize()
                ),
            ));
        }
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_reader() {
        let data: &[u8] = b"";
        let mut buf = [0; 1];

        let mut reader = Crc32Reader::new(data, 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        let mut reader = Crc32Reader::new(data, 1);
        assert!(reader
            .read(&mut buf)
            .unwrap_err()
            .to_string()
            .contains("Invalid checksum"));
    }

    #[test]
    fn test_read_to_end() {
        let mut out = Vec::new();
        let mut reader = Crc32Reader::new(&b"1234"[..], 0x9be3e0a3);
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"1234");

        let mut reader = Crc32Reader::new(&b"1235"[..], 0x9be3e0a3);
        assert!(reader.read_to_end(&mut Vec::new()).is_err());
    }

    #[test]
    fn test_zero_read() {
        let data: &[u8] = b"1234";
        let mut buf = [0; 5];

        let mut reader = Crc32Reader::new(data, 0x9be3e0a3);
        // A zero-length read isn't EOF, so it doesn't trip the check.
        assert_eq!(reader.read(&mut buf[..0]).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
