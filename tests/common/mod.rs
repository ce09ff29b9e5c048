//! Builds archives in memory and picks apart the multipart output.

#![allow(dead_code)]

use std::io::Write;

use anyhow::{bail, ensure, Context, Result};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use tokio::io::AsyncReadExt;

use ingest::multipart::MultipartEncoder;
use ingest::source::ChunkSource;
use ingest::{FilterConfiguration, PipelineDriver, PipelineStats};

pub const BOUNDARY: &str = "----WebKitFormBoundaryTESTtestTEST1234";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A TAR header for a regular file (`'0'`) or directory (`'5'`)
pub fn tar_header(name: &str, size: u64, typeflag: u8) -> Vec<u8> {
    let mut block = vec![0u8; 512];
    block[..name.len()].copy_from_slice(name.as_bytes());
    block[100..108].copy_from_slice(b"0000644\0");
    block[124..136].copy_from_slice(format!("{:011o}\0", size).as_bytes());
    block[156] = typeflag;
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    // Checksum: the header summed with the checksum field as spaces
    block[148..156].copy_from_slice(b"        ");
    let sum: u32 = block.iter().map(|&b| b as u32).sum();
    block[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());
    block
}

/// A TAR archive. Names ending in `/` become directories.
pub fn tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in entries {
        let typeflag = if name.ends_with('/') { b'5' } else { b'0' };
        out.extend(tar_header(name, data.len() as u64, typeflag));
        out.extend_from_slice(data);
        let padding = (512 - data.len() % 512) % 512;
        out.extend(std::iter::repeat(0u8).take(padding));
    }
    // End of archive
    out.extend([0u8; 1024]);
    out
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    Stored,
    Deflate,
    /// Stored bytes labelled with some other method code
    Other(u16),
}

/// A ZIP archive with a central directory, like the ones GitHub hands out.
/// Names ending in `/` become directories.
pub fn zip(entries: &[(&str, &[u8], Method)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, data, method) in entries {
        let offset = out.len() as u32;
        let (code, payload) = match method {
            Method::Stored => (0u16, data.to_vec()),
            Method::Deflate => (8u16, deflate(data)),
            Method::Other(code) => (*code, data.to_vec()),
        };
        let crc = crc32fast::hash(data);

        out.extend(b"PK\x03\x04");
        out.extend(20u16.to_le_bytes());
        out.extend(0x0800u16.to_le_bytes()); // UTF-8 names
        out.extend(code.to_le_bytes());
        out.extend([0u8; 4]); // time, date
        out.extend(crc.to_le_bytes());
        out.extend((payload.len() as u32).to_le_bytes());
        out.extend((data.len() as u32).to_le_bytes());
        out.extend((name.len() as u16).to_le_bytes());
        out.extend(0u16.to_le_bytes());
        out.extend(name.as_bytes());
        out.extend(&payload);

        central.extend(b"PK\x01\x02");
        central.extend(20u16.to_le_bytes());
        central.extend(20u16.to_le_bytes());
        central.extend(0x0800u16.to_le_bytes());
        central.extend(code.to_le_bytes());
        central.extend([0u8; 4]);
        central.extend(crc.to_le_bytes());
        central.extend((payload.len() as u32).to_le_bytes());
        central.extend((data.len() as u32).to_le_bytes());
        central.extend((name.len() as u16).to_le_bytes());
        central.extend([0u8; 12]); // extra, comment, disk, attributes
        central.extend(offset.to_le_bytes());
        central.extend(name.as_bytes());
    }
    let central_offset = out.len() as u32;
    out.extend(&central);
    out.extend(b"PK\x05\x06");
    out.extend([0u8; 4]);
    out.extend((entries.len() as u16).to_le_bytes());
    out.extend((entries.len() as u16).to_le_bytes());
    out.extend((central.len() as u32).to_le_bytes());
    out.extend(central_offset.to_le_bytes());
    out.extend(0u16.to_le_bytes());
    out
}

/// One parsed multipart section
#[derive(Debug)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Part {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `name` parameter of `Content-Disposition`
    pub fn name(&self) -> &str {
        let disposition = self.header("Content-Disposition").unwrap_or_default();
        disposition
            .split("name=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap_or_default()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a multipart body into parts, requiring the closing boundary.
pub fn parse_multipart(mut body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{boundary}\r\n");
    let closing = format!("--{boundary}--\r\n");
    let mut parts = Vec::new();
    loop {
        if body == closing.as_bytes() {
            return Ok(parts);
        }
        ensure!(body.starts_with(delimiter.as_bytes()), "Expected a boundary");
        body = &body[delimiter.len()..];

        let header_end = find(body, b"\r\n\r\n").context("Unterminated part headers")?;
        let headers = std::str::from_utf8(&body[..header_end])?
            .split("\r\n")
            .map(|line| {
                let (k, v) = line.split_once(": ").context("Malformed header")?;
                Ok((k.to_owned(), v.to_owned()))
            })
            .collect::<Result<Vec<_>>>()?;
        body = &body[header_end + 4..];

        // Bodies are binary-safe: use Content-Length when we have it.
        let len = match headers.iter().find(|(k, _)| k == "Content-Length") {
            Some((_, v)) => v.parse()?,
            None => 0,
        };
        ensure!(body.len() >= len + 2, "Truncated part body");
        let part_body = body[..len].to_vec();
        if &body[len..len + 2] != b"\r\n" {
            bail!("Part body isn't followed by CRLF");
        }
        body = &body[len + 2..];
        parts.push(Part {
            headers,
            body: part_body,
        });
    }
}

/// Runs an archive through the pipeline in `chunk_size` chunks,
/// returning the raw multipart output.
pub async fn ingest_raw(
    archive: &[u8],
    config: FilterConfiguration,
    chunk_size: usize,
) -> Result<(Vec<u8>, PipelineStats)> {
    // The pipeline consumes its encoder, so read the output off the other end of a pipe.
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let encoder = MultipartEncoder::with_boundary(writer, BOUNDARY.to_owned());
    let source = ChunkSource::split(archive.to_vec(), chunk_size);

    let (stats, out) = tokio::join!(PipelineDriver::new(config).run(source, encoder), async {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.map(|_| out)
    });
    Ok((out?, stats?))
}

/// Like [`ingest_raw`], with the config from a query string and the output parsed.
pub async fn ingest(
    archive: &[u8],
    query: &str,
    chunk_size: usize,
) -> Result<(Vec<Part>, PipelineStats)> {
    let (out, stats) = ingest_raw(archive, FilterConfiguration::from_query(query), chunk_size).await?;
    Ok((parse_multipart(&out, BOUNDARY)?, stats))
}
