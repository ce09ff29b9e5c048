//! ingest streams a source archive (ZIP, TAR, or gzipped TAR) of unknown length
//! and re-encodes the files it wants as a `multipart/form-data` body,
//! one entry in flight at a time:
//!
//! ```no_run
//! # use ingest::*;
//! # use ingest::source::ReaderSource;
//! # async fn go() -> anyhow::Result<()> {
//! let archive = tokio::fs::File::open("repo.tar.gz").await?;
//! let config = FilterConfiguration::from_query("omitFirstSegment&excludePathPatterns=*.lock");
//!
//! let encoder = MultipartEncoder::new(tokio::io::stdout());
//! let stats = PipelineDriver::new(config)
//!     .run(ReaderSource::new(archive), encoder)
//!     .await?;
//! eprintln!("{stats}");
//! # Ok(())
//! # }
//! ```
//!
//! Unlike a ZIP reader that starts at the central directory
//! (and so needs the whole file, or at least random access to it),
//! everything here works front-to-back on whatever chunks arrive.
//! The decoders are push-based state machines ([`reader::Decoder`])
//! that don't care where a chunk boundary falls.
//! Entry content is buffered only until it's been filtered and written,
//! and entries over the size limit are skipped without being buffered at all.
//!
//! The decoders can be used on their own, too:
//! ```no_run
//! # use ingest::*;
//! # use ingest::source::ChunkSource;
//! # async fn go(bytes: Vec<u8>) -> anyhow::Result<()> {
//! let mut reader = ArchiveReader::new(
//!     ChunkSource::split(bytes, 4096),
//!     ArchiveFormat::Zip,
//!     DecoderOptions::default(),
//! );
//! while let Some(entry) = reader.next_entry().await? {
//!     println!("{} ({:?} bytes)", entry.path, entry.declared_size);
//!     // Content is only inflated if we ask for it.
//!     entry.content.cancel();
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod classify;
pub mod detect;
pub mod entry;
pub mod filter;
pub mod genignore;
pub mod gzip;
pub mod multipart;
pub mod pipeline;
pub mod reader;
pub mod result;
pub mod source;
pub mod tar;
pub mod zip;

pub use detect::ArchiveFormat;
pub use entry::{ArchiveEntry, CompressionMethod, EntryContent};
pub use filter::{CompiledMatcherSet, FilterConfiguration, FilterDecision, FilterReason};
pub use multipart::{MultipartEncoder, MultipartPart};
pub use pipeline::{PipelineDriver, PipelineStats};
pub use reader::{ArchiveReader, DecoderOptions};
pub use result::{IngestError, IngestResult};

mod arch;
mod crc_reader;
