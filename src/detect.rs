//! Telling archive formats apart by their first few bytes

use std::fmt;
use std::str::FromStr;

use crate::gzip::{GzipDecoder, GZIP_MAGIC};
use crate::reader::{Decoder, DecoderOptions};
use crate::result::*;
use crate::tar::TarDecoder;
use crate::zip::{ZipDecoder, EOCDR_MAGIC, LOCAL_FILE_HEADER_MAGIC};

/// How many bytes [`sniff`] wants to look at
pub const SNIFF_LEN: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    /// gzip-compressed TAR
    TarGz,
    /// Uncompressed TAR
    Tar,
}

impl ArchiveFormat {
    /// The name reported in the first field of `x-filter` headers
    pub fn plugin_name(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "ingestzip",
            ArchiveFormat::TarGz | ArchiveFormat::Tar => "ingesttar",
        }
    }

    /// Builds a fresh decoder for this format.
    pub fn decoder(self, options: DecoderOptions) -> Box<dyn Decoder> {
        match self {
            ArchiveFormat::Zip => Box::new(ZipDecoder::new(options)),
            ArchiveFormat::TarGz => Box::new(GzipDecoder::new(TarDecoder::new(options))),
            ArchiveFormat::Tar => Box::new(TarDecoder::new(options)),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Tar => "tar",
        })
    }
}

impl FromStr for ArchiveFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> IngestResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "tgz" | "targz" => Ok(ArchiveFormat::TarGz),
            "tar" => Ok(ArchiveFormat::Tar),
            _ => Err(IngestError::UnsupportedArchive(s.to_owned())),
        }
    }
}

/// Guesses the format from the start of the stream.
///
/// ZIPs start with a local file header
/// (or, if they're empty, the end of central directory record).
/// Anything that isn't ZIP or gzip is assumed to be a plain TAR.
pub fn sniff(prefix: &[u8]) -> ArchiveFormat {
    if prefix.starts_with(&LOCAL_FILE_HEADER_MAGIC) || prefix.starts_with(&EOCDR_MAGIC) {
        ArchiveFormat::Zip
    } else if prefix.starts_with(&GZIP_MAGIC) {
        ArchiveFormat::TarGz
    } else {
        ArchiveFormat::Tar
    }
}
