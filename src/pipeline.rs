//! Archive in, multipart out
//!
//! [`PipelineDriver::run`] sniffs the format, runs the `.genignore` pre-pass,
//! then walks the archive one entry at a time:
//! filter, read, classify, encode, next.
//! An entry's content is read (or cancelled) before the decoder is asked
//! for the next header, so memory use tops out around the largest entry
//! we're willing to buffer, regardless of archive size.

use std::fmt;

use log::*;
use tokio::io::AsyncWrite;

use crate::classify::{content_type, has_binary_extension, is_utf8};
use crate::detect::{sniff, ArchiveFormat, SNIFF_LEN};
use crate::entry::ArchiveEntry;
use crate::filter::{CompiledMatcherSet, FilterConfiguration, FilterDecision, FilterReason};
use crate::genignore;
use crate::multipart::{FilterTag, MultipartEncoder, MultipartPart, TransferEncoding};
use crate::reader::{ArchiveReader, DecoderOptions};
use crate::result::*;
use crate::source::{fill, ByteSource, Recorder};

/// What happened over one run
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Every entry the decoder produced, directories included
    pub entries: u64,
    pub directories: u64,
    /// Parts with the entry's content as their body
    pub bodies: u64,
    /// Bodiless parts with an `x-filter` header (errors not included)
    pub filtered: u64,
    /// Bodiless parts with an `x-url` header
    pub url_references: u64,
    /// Entries whose content couldn't be read
    pub errors: u64,
    pub body_bytes: u64,
    /// The archive had its own `.genignore`.
    pub genignore_found: bool,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries ({} directories): {} bodies ({} bytes), {} filtered, {} URLs, {} errors",
            self.entries,
            self.directories,
            self.bodies,
            self.body_bytes,
            self.filtered,
            self.url_references,
            self.errors
        )
    }
}

/// Joins the raw URL prefix and an output path.
pub fn raw_url(prefix: &str, path: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), path)
}

/// Drives one archive through the filters and out an encoder.
pub struct PipelineDriver {
    config: FilterConfiguration,
    verify_crc: bool,
}

impl PipelineDriver {
    pub fn new(config: FilterConfiguration) -> Self {
        Self {
            config,
            verify_crc: false,
        }
    }

    /// Check ZIP CRC-32s as entries are read.
    /// Mismatches are reported like any other unreadable entry.
    pub fn verify_crc(mut self, verify: bool) -> Self {
        self.verify_crc = verify;
        self
    }

    /// Runs the whole archive.
    ///
    /// Per-entry problems become `x-filter` parts and the run carries on.
    /// Errors reading the source or writing the sink end the run
    /// without the closing boundary, so the output is visibly truncated.
    pub async fn run<S, W>(
        mut self,
        source: S,
        encoder: MultipartEncoder<W>,
    ) -> IngestResult<PipelineStats>
    where
        S: ByteSource,
        W: AsyncWrite + Unpin + Send,
    {
        let mut recorder = Recorder::new(source);
        let format = match self.config.format {
            Some(f) => f,
            None => {
                fill(&mut recorder, SNIFF_LEN).await?;
                sniff(&recorder.head(SNIFF_LEN))
            }
        };
        debug!("Reading {format} archive");
        let source = recorder.into_replay();

        if self.config.genignore {
            let resolved = genignore::resolve(source, format).await;
            self.config.genignore_patterns.extend(resolved.patterns);
            self.drive(resolved.source, format, encoder, resolved.found)
                .await
        } else {
            self.drive(source, format, encoder, false).await
        }
    }

    async fn drive<S, W>(
        &self,
        source: S,
        format: ArchiveFormat,
        mut encoder: MultipartEncoder<W>,
        genignore_found: bool,
    ) -> IngestResult<PipelineStats>
    where
        S: ByteSource,
        W: AsyncWrite + Unpin + Send,
    {
        let matchers = CompiledMatcherSet::compile(&self.config);
        let options = DecoderOptions {
            verify_crc: self.verify_crc,
            buffer_limit: self.config.max_file_size,
        };
        let mut reader = ArchiveReader::new(source, format, options);
        let mut stats = PipelineStats {
            genignore_found,
            ..Default::default()
        };
        let plugin = format.plugin_name();

        while let Some(entry) = reader.next_entry().await? {
            stats.entries += 1;
            if entry.is_dir {
                stats.directories += 1;
                entry.content.cancel();
                continue;
            }
            let part = self.process(entry, &matchers, plugin, &mut stats);
            encoder.write_part(&part).await?;
        }

        stats.body_bytes = encoder.body_bytes();
        encoder.finish().await?;
        debug!("Pipeline done: {stats}");
        Ok(stats)
    }

    /// Decides what part an entry becomes, reading its content if needed.
    fn process(
        &self,
        entry: ArchiveEntry,
        matchers: &CompiledMatcherSet,
        plugin: &'static str,
        stats: &mut PipelineStats,
    ) -> MultipartPart {
        let path = matchers.output_path(&entry.path).to_owned();
        let mime = content_type(&path);
        let raw_url_prefix = self.config.raw_url_prefix.as_deref();
        let reject = |path: String, reason: FilterReason| {
            let mut part = MultipartPart::filtered(
                path,
                mime,
                FilterTag {
                    plugin,
                    status: reason.status().into(),
                    message: reason.message().into(),
                },
            );
            // Too big to embed, but still fetchable from the source.
            if reason == FilterReason::TooLarge {
                part.url = raw_url_prefix.map(|prefix| raw_url(prefix, &part.name));
            }
            part
        };

        if let FilterDecision::Reject(reason) = matchers.evaluate(&entry.path, entry.declared_size)
        {
            debug!("Filtered {}: {}", entry.path, reason.message());
            entry.content.cancel();
            stats.filtered += 1;
            return reject(path, reason);
        }

        if let Some(prefix) = raw_url_prefix {
            if has_binary_extension(&path) {
                // No point inflating what we won't send.
                entry.content.cancel();
                stats.url_references += 1;
                let url = raw_url(prefix, &path);
                return MultipartPart::url_reference(path, mime, url);
            }
        }

        let content = match entry.content.read_all() {
            Ok(c) => c,
            Err(e) => {
                warn!("Couldn't read {}: {e}", entry.path);
                stats.errors += 1;
                return MultipartPart::filtered(
                    path,
                    mime,
                    FilterTag {
                        plugin,
                        status: "500".into(),
                        message: e.to_string().into(),
                    },
                );
            }
        };

        // Data descriptor entries didn't declare a size up front.
        if matchers.too_large(content.len() as u64) {
            debug!("Filtered {} after reading: {} bytes", entry.path, content.len());
            stats.filtered += 1;
            return reject(path, FilterReason::TooLarge);
        }

        if is_utf8(&content) {
            stats.bodies += 1;
            return MultipartPart::with_body(path, mime, content, TransferEncoding::EightBit);
        }

        if let Some(prefix) = raw_url_prefix {
            stats.url_references += 1;
            let url = raw_url(prefix, &path);
            MultipartPart::url_reference(path, mime, url)
        } else if self.config.omit_binary {
            stats.filtered += 1;
            reject(path, FilterReason::BinaryExtension)
        } else {
            stats.bodies += 1;
            MultipartPart::with_body(path, mime, content, TransferEncoding::Binary)
        }
    }
}
