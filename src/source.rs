//! Where archive bytes come from.
//!
//! A [`ByteSource`] hands out chunks of an archive in order until it runs dry.
//! The service reads them off an HTTP response, the probe tool off a file.
//!
//! [`Recorder`] and [`Replay`] let us read the front of a source twice
//! (once to sniff the format or look for `.genignore`, once for real)
//! while holding only the bytes the first read actually pulled.

use std::collections::VecDeque;
use std::future::Future;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default read size for [`ReaderSource`]
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// An asynchronous, single-pass stream of byte chunks.
///
/// `Ok(None)` marks the end of the stream.
/// Chunks may be any size, including ones that split headers.
pub trait ByteSource: Send {
    fn next_chunk(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Reads chunks from any [`AsyncRead`].
pub struct ReaderSource<R> {
    reader: R,
    chunk_size: usize,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> ByteSource for ReaderSource<R> {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let count = self.reader.read_buf(&mut buf).await?;
        if count == 0 {
            Ok(None)
        } else {
            Ok(Some(buf.freeze()))
        }
    }
}

/// Hands out chunks that are already in memory.
#[derive(Debug, Default)]
pub struct ChunkSource {
    chunks: VecDeque<Bytes>,
}

impl ChunkSource {
    pub fn new<I: IntoIterator<Item = Bytes>>(chunks: I) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }

    /// Splits `data` into chunks of `chunk_size` bytes (the last may be shorter).
    pub fn split(data: impl Into<Bytes>, chunk_size: usize) -> Self {
        let mut data = data.into();
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::new();
        while !data.is_empty() {
            chunks.push_back(data.split_to(chunk_size.min(data.len())));
        }
        Self { chunks }
    }
}

impl ByteSource for ChunkSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// Keeps a copy of every chunk read through it
/// so they can be read again with [`into_replay`](Self::into_replay).
pub struct Recorder<S> {
    inner: S,
    recorded: Vec<Bytes>,
    recorded_len: usize,
    limit: Option<usize>,
}

impl<S> Recorder<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            recorded: Vec::new(),
            recorded_len: 0,
            limit: None,
        }
    }

    /// Like [`new`](Self::new), but once `limit` bytes have been recorded,
    /// further reads fail with [`io::ErrorKind::OutOfMemory`]
    /// instead of holding more.
    /// Whatever was recorded is still replayed in full.
    pub fn with_limit(inner: S, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(inner)
        }
    }

    /// Total bytes read (and held) so far
    pub fn recorded_len(&self) -> usize {
        self.recorded_len
    }

    /// The first `len` bytes read so far (fewer if we haven't read that many)
    pub fn head(&self, len: usize) -> Vec<u8> {
        self.recorded
            .iter()
            .flat_map(|c| c.iter().copied())
            .take(len)
            .collect()
    }

    /// Rewinds to the start: the returned source yields the recorded chunks,
    /// then carries on with the rest of the inner source.
    pub fn into_replay(self) -> Replay<S> {
        Replay {
            prefix: self.recorded.into(),
            inner: self.inner,
        }
    }
}

impl<S: ByteSource> ByteSource for Recorder<S> {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(limit) = self.limit.filter(|l| self.recorded_len >= *l) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("Recorded {} bytes, over the {limit} byte limit", self.recorded_len),
            ));
        }
        let chunk = self.inner.next_chunk().await?;
        if let Some(c) = &chunk {
            // Bytes clones share the allocation.
            self.recorded.push(c.clone());
            self.recorded_len += c.len();
        }
        Ok(chunk)
    }
}

/// Recorded chunks followed by the rest of a source
pub struct Replay<S> {
    prefix: VecDeque<Bytes>,
    inner: S,
}

impl<S> Replay<S> {
    /// Chunks left to replay before we're back to reading the inner source
    pub fn pending(&self) -> usize {
        self.prefix.len()
    }

    /// Bytes held for replay
    pub fn pending_len(&self) -> usize {
        self.prefix.iter().map(Bytes::len).sum()
    }
}

impl<S: ByteSource> ByteSource for Replay<S> {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.prefix.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => self.inner.next_chunk().await,
        }
    }
}

/// Reads until at least `len` bytes (or the whole source, if it's shorter)
/// have been recorded.
pub async fn fill<S: ByteSource>(recorder: &mut Recorder<S>, len: usize) -> io::Result<()> {
    while recorder.recorded_len() < len {
        if recorder.next_chunk().await?.is_none() {
            break;
        }
    }
    Ok(())
}
