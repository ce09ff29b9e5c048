//! Writing entries out as `multipart/form-data`
//!
//! This is the wire format every downstream renderer parses,
//! so header names, order, and spelling are fixed:
//!
//! ```text
//! --<boundary>
//! Content-Disposition: form-data; name="<path>"; filename="<path>"
//! Content-Type: <mime>
//! Content-Length: <n>                      (parts with a body)
//! x-file-hash: <sha-256 hex>               (parts with a body)
//! x-url: <prefix>/<path>                   (binary or oversize files, with rawUrlPrefix)
//! x-filter: <plugin>;<status>;<message>    (filtered entries)
//! Content-Transfer-Encoding: 8bit|binary
//!
//! <body>
//! ```
//!
//! and after the last part, `--<boundary>--`.

use std::borrow::Cow;
use std::io;

use bytes::Bytes;
use log::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const BOUNDARY_PREFIX: &str = "----WebKitFormBoundary";

/// `----WebKitFormBoundary` followed by 16 random alphanumerics
pub fn random_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{BOUNDARY_PREFIX}{suffix}")
}

/// The response's `Content-Type`.
///
/// Browsers get the same bytes labelled `text/plain`
/// so they display them instead of downloading them.
pub fn content_type(boundary: &str, for_browser: bool) -> String {
    if for_browser {
        format!("text/plain; boundary={boundary}")
    } else {
        format!("multipart/form-data; boundary={boundary}")
    }
}

/// Hex SHA-256
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferEncoding {
    /// Valid UTF-8
    EightBit,
    Binary,
}

impl TransferEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::Binary => "binary",
        }
    }
}

/// The contents of an `x-filter` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTag {
    pub plugin: &'static str,
    pub status: Cow<'static, str>,
    pub message: Cow<'static, str>,
}

/// One section of the multipart body
#[derive(Debug, Clone)]
pub struct MultipartPart {
    /// Used for both `name` and `filename`
    pub name: String,
    pub content_type: &'static str,
    pub content_length: Option<u64>,
    pub content_hash: Option<String>,
    pub url: Option<String>,
    pub filter: Option<FilterTag>,
    pub transfer_encoding: TransferEncoding,
    pub body: Bytes,
}

impl MultipartPart {
    /// A part carrying the entry's content
    pub fn with_body(
        name: String,
        content_type: &'static str,
        body: Bytes,
        transfer_encoding: TransferEncoding,
    ) -> Self {
        Self {
            name,
            content_type,
            content_length: Some(body.len() as u64),
            content_hash: Some(sha256_hex(&body)),
            url: None,
            filter: None,
            transfer_encoding,
            body,
        }
    }

    /// A bodiless part reporting why the entry was left out
    pub fn filtered(name: String, content_type: &'static str, filter: FilterTag) -> Self {
        Self {
            name,
            content_type,
            content_length: None,
            content_hash: None,
            url: None,
            filter: Some(filter),
            transfer_encoding: TransferEncoding::Binary,
            body: Bytes::new(),
        }
    }

    /// A bodiless part pointing at where the content can be fetched
    pub fn url_reference(name: String, content_type: &'static str, url: String) -> Self {
        Self {
            name,
            content_type,
            content_length: None,
            content_hash: None,
            url: Some(url),
            filter: None,
            transfer_encoding: TransferEncoding::Binary,
            body: Bytes::new(),
        }
    }
}

/// Escapes a value for a quoted `Content-Disposition` parameter.
fn escape_quoted(value: &str) -> Cow<'_, str> {
    if !value.contains(['"', '\r', '\n']) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(
        value
            .replace('"', "%22")
            .replace('\r', "%0D")
            .replace('\n', "%0A"),
    )
}

/// Keeps a value on one header line.
fn one_line(value: &str) -> Cow<'_, str> {
    if !value.contains(['\r', '\n']) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(value.replace('\r', "%0D").replace('\n', "%0A"))
}

/// `x-filter` fields are `;`-separated, so messages can't contain one.
fn filter_field(value: &str) -> Cow<'_, str> {
    if !value.contains([';', '\r', '\n']) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(value.replace([';', '\r', '\n'], " "))
}

fn part_header(boundary: &str, part: &MultipartPart) -> String {
    let name = escape_quoted(&part.name);
    let mut header = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\n\
         Content-Type: {}\r\n",
        part.content_type
    );
    if let Some(len) = part.content_length {
        header.push_str(&format!("Content-Length: {len}\r\n"));
    }
    if let Some(hash) = &part.content_hash {
        header.push_str(&format!("x-file-hash: {hash}\r\n"));
    }
    if let Some(url) = &part.url {
        header.push_str(&format!("x-url: {}\r\n", one_line(url)));
    }
    if let Some(filter) = &part.filter {
        header.push_str(&format!(
            "x-filter: {};{};{}\r\n",
            filter.plugin,
            filter_field(&filter.status),
            filter_field(&filter.message)
        ));
    }
    header.push_str(&format!(
        "Content-Transfer-Encoding: {}\r\n\r\n",
        part.transfer_encoding.as_str()
    ));
    header
}

/// Streams parts to an async sink.
///
/// Every write is awaited, so a slow sink slows down whoever is producing parts.
pub struct MultipartEncoder<W> {
    sink: W,
    boundary: String,
    parts: u64,
    body_bytes: u64,
}

impl<W: AsyncWrite + Unpin> MultipartEncoder<W> {
    pub fn new(sink: W) -> Self {
        Self::with_boundary(sink, random_boundary())
    }

    pub fn with_boundary(sink: W, boundary: String) -> Self {
        Self {
            sink,
            boundary,
            parts: 0,
            body_bytes: 0,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Parts written so far
    pub fn parts(&self) -> u64 {
        self.parts
    }

    /// Body bytes written so far (not counting headers)
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    pub async fn write_part(&mut self, part: &MultipartPart) -> io::Result<()> {
        trace!("Writing part {:?}", part.name);
        let header = part_header(&self.boundary, part);
        self.sink.write_all(header.as_bytes()).await?;
        self.sink.write_all(&part.body).await?;
        self.sink.write_all(b"\r\n").await?;
        self.sink.flush().await?;
        self.parts += 1;
        self.body_bytes += part.body.len() as u64;
        Ok(())
    }

    /// Writes the closing boundary and hands back the sink.
    pub async fn finish(mut self) -> io::Result<W> {
        let closing = format!("--{}--\r\n", self.boundary);
        self.sink.write_all(closing.as_bytes()).await?;
        self.sink.flush().await?;
        Ok(self.sink)
    }
}
