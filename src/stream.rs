//! Connection stream with non-destructive look-ahead.
//!
//! Protocol detection needs to look at the first bytes of a connection without taking them away
//! from whoever handles it next. [`PeekableStream`] keeps everything it has peeked in a prefix
//! buffer and serves reads from that buffer before touching the socket again.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const READ_CHUNK: usize = 8192;

/// Anything a connection can be carried over.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased transport, plain TCP or TLS alike.
pub type BoxStream = Box<dyn AsyncIo>;

/// A peek that could not be satisfied.
///
/// The bytes that did arrive stay in the stream's buffer and remain readable.
#[derive(Debug)]
pub struct PeekError {
  buffered: usize,
  source: io::Error,
}

impl PeekError {
  /// Number of bytes buffered when the error occurred.
  pub fn buffered(&self) -> usize {
    self.buffered
  }

  /// The underlying I/O error, end-of-stream included.
  pub fn io(&self) -> &io::Error {
    &self.source
  }

  /// Closed before a single byte arrived.
  pub fn is_clean_eof(&self) -> bool {
    self.buffered == 0 && self.source.kind() == io::ErrorKind::UnexpectedEof
  }
}

impl fmt::Display for PeekError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "peek failed after {} bytes: {}", self.buffered, self.source)
  }
}

impl std::error::Error for PeekError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.source)
  }
}

impl From<PeekError> for io::Error {
  fn from(value: PeekError) -> Self {
    value.source
  }
}

impl From<PeekError> for crate::Error {
  fn from(value: PeekError) -> Self {
    crate::Error::Io(value.source)
  }
}

/// Stream wrapper with a replayable prefix buffer.
pub struct PeekableStream<S = BoxStream> {
  inner: S,
  buf: BytesMut,
}

impl<S> fmt::Debug for PeekableStream<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PeekableStream")
      .field("buffered", &self.buf.len())
      .finish()
  }
}

impl<S> PeekableStream<S> {
  /// Wrap a stream with an empty look-ahead buffer.
  pub fn new(inner: S) -> Self {
    PeekableStream {
      inner,
      buf: BytesMut::new(),
    }
  }

  /// Bytes peeked but not yet read.
  pub fn buffered(&self) -> &[u8] {
    &self.buf
  }

  /// Borrow the wrapped stream.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }

  /// Give back the wrapped stream together with any bytes still buffered.
  pub fn into_parts(self) -> (S, BytesMut) {
    (self.inner, self.buf)
  }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
  /// Return the first `n` bytes without consuming them.
  ///
  /// Waits across short reads until `n` bytes are buffered. Bytes that are already buffered are
  /// never read again, and the buffer only grows as far as the largest `n` requested.
  pub async fn peek(&mut self, n: usize) -> Result<&[u8], PeekError> {
    while self.buf.len() < n {
      let want = n - self.buf.len();
      self.fill(want).await?;
    }
    Ok(&self.buf[..n])
  }

  /// Grow the buffer until `delimiter` appears, returning the prefix through the delimiter.
  ///
  /// Returns `Ok(None)` once `max` bytes are buffered without a match.
  pub async fn peek_until(
    &mut self,
    delimiter: &[u8],
    max: usize,
  ) -> Result<Option<&[u8]>, PeekError> {
    let mut searched = 0;
    loop {
      if let Some(pos) = find(&self.buf[searched..], delimiter) {
        let end = searched + pos + delimiter.len();
        return Ok(Some(&self.buf[..end]));
      }
      if self.buf.len() >= max {
        return Ok(None);
      }
      searched = self.buf.len().saturating_sub(delimiter.len().saturating_sub(1));
      let want = (max - self.buf.len()).min(READ_CHUNK);
      self.fill(want).await?;
    }
  }

  /// Drop `n` buffered bytes, as if they had been read.
  pub fn discard(&mut self, n: usize) {
    let n = n.min(self.buf.len());
    self.buf.advance(n);
  }

  async fn fill(&mut self, want: usize) -> Result<(), PeekError> {
    self.buf.reserve(want);
    let result = {
      let mut limited = (&mut self.buf).limit(want);
      self.inner.read_buf(&mut limited).await
    };
    let read = result.map_err(|source| PeekError {
      buffered: self.buf.len(),
      source,
    })?;
    if read == 0 {
      return Err(PeekError {
        buffered: self.buf.len(),
        source: io::Error::from(io::ErrorKind::UnexpectedEof),
      });
    }
    Ok(())
  }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  if needle.is_empty() {
    return Some(0);
  }
  haystack.windows(needle.len()).position(|w| w == needle)
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if !this.buf.is_empty() {
      let n = this.buf.len().min(buf.remaining());
      buf.put_slice(&this.buf[..n]);
      this.buf.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncRead + Unpin> AsyncBufRead for PeekableStream<S> {
  fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
    let this = self.get_mut();
    if this.buf.is_empty() {
      let mut chunk = [0u8; READ_CHUNK];
      let mut read_buf = ReadBuf::new(&mut chunk);
      ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
      this.buf.extend_from_slice(read_buf.filled());
    }
    Poll::Ready(Ok(&this.buf[..]))
  }

  fn consume(self: Pin<&mut Self>, amt: usize) {
    self.get_mut().discard(amt);
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
