//! HTTP/1.x framing shared by the request and response codecs.

use crate::error::{new_io_error, Error, Result};
use crate::CR_LF;
use bytes::Bytes;
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// How the body following a message head is delimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Framing {
  #[default]
  Empty,
  Length(u64),
  Chunked,
  UntilClose,
}

/// Read a message head through its terminating blank line.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte. Blank lines ahead of the
/// start line are skipped.
pub(crate) async fn read_head<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = Vec::new();
  loop {
    let start = head.len();
    let n = reader.read_until(b'\n', &mut head).await?;
    if n == 0 {
      if head.is_empty() {
        return Ok(None);
      }
      return Err(new_io_error(ErrorKind::UnexpectedEof, "eof inside message head"));
    }
    if head.len() > max {
      return Err(Error::invalid_request("message head too large"));
    }
    let line = &head[start..];
    if line == CR_LF || line == b"\n" {
      if start == 0 {
        head.clear();
        continue;
      }
      return Ok(Some(head));
    }
  }
}

/// Split a head into its start line and header lines, without line terminators.
pub(crate) fn split_head(head: &[u8]) -> (&[u8], impl Iterator<Item = &[u8]>) {
  let mut lines = head
    .split(|b| *b == b'\n')
    .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
    .filter(|line| !line.is_empty());
  let start = lines.next().unwrap_or_default();
  (start, lines)
}

/// Build a header map from raw header lines.
pub(crate) fn parse_headers<'a>(lines: impl Iterator<Item = &'a [u8]>) -> Result<http::HeaderMap> {
  let mut headers = http::HeaderMap::new();
  for line in lines {
    let (k, v) = parser_headers(line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(http::HeaderName, http::HeaderValue)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let Some(colon) = buffer.iter().position(|b| *b == b':') else {
    return Err(Error::invalid_request("header line without a colon"));
  };
  let name = http::HeaderName::from_bytes(&buffer[..colon])
    .map_err(|e| Error::Http(http::Error::from(e)))?;
  let value = trim_ascii(&buffer[colon + 1..]);
  let value =
    http::HeaderValue::from_bytes(value).map_err(|e| Error::Http(http::Error::from(e)))?;
  Ok((name, value))
}

fn trim_ascii(mut value: &[u8]) -> &[u8] {
  while let [b' ' | b'\t', rest @ ..] = value {
    value = rest;
  }
  while let [rest @ .., b' ' | b'\t'] = value {
    value = rest;
  }
  value
}

pub(crate) fn parse_version(raw: &[u8]) -> Result<http::Version> {
  match raw {
    b"HTTP/0.9" => Ok(http::Version::HTTP_09),
    b"HTTP/1.0" => Ok(http::Version::HTTP_10),
    b"HTTP/1.1" => Ok(http::Version::HTTP_11),
    _ => Err(Error::invalid_request(format!(
      "unsupported http version {}",
      raw.escape_ascii()
    ))),
  }
}

/// Whether a comma separated header contains `token`, case-insensitively.
pub(crate) fn header_has_token(
  headers: &http::HeaderMap,
  name: http::header::HeaderName,
  token: &str,
) -> bool {
  headers
    .get_all(name)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Persistent-connection semantics shared by requests and responses.
pub(crate) fn keep_alive(version: http::Version, headers: &http::HeaderMap) -> bool {
  if header_has_token(headers, http::header::CONNECTION, "close") {
    return false;
  }
  match version {
    http::Version::HTTP_10 | http::Version::HTTP_09 => {
      header_has_token(headers, http::header::CONNECTION, "keep-alive")
    }
    _ => true,
  }
}

/// Framing of a message body given its headers, falling back to `otherwise`.
pub(crate) fn framing_from_headers(headers: &http::HeaderMap, otherwise: Framing) -> Result<Framing> {
  if header_has_token(headers, http::header::TRANSFER_ENCODING, "chunked") {
    return Ok(Framing::Chunked);
  }
  match headers.get(http::header::CONTENT_LENGTH) {
    Some(value) => {
      let length = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::invalid_request("invalid content-length"))?;
      Ok(Framing::Length(length))
    }
    None => Ok(otherwise),
  }
}

fn body_too_large(max: usize) -> Error {
  Error::invalid_request(format!("message body larger than {} bytes", max))
}

/// Size of one chunk from its size line, extensions ignored.
fn parse_chunk_size(line: &[u8]) -> Result<u64> {
  std::str::from_utf8(line)
    .ok()
    .and_then(|s| s.split(';').next())
    .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
    .ok_or_else(|| Error::invalid_request("invalid chunk size"))
}

/// Read a whole body into memory, refusing anything over `max` bytes.
pub(crate) async fn read_body<R>(reader: &mut R, framing: Framing, max: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  match framing {
    Framing::Empty | Framing::Length(0) => Ok(Bytes::new()),
    Framing::Length(length) => {
      if length > max as u64 {
        return Err(body_too_large(max));
      }
      let mut body = Vec::with_capacity(length.min(1 << 20) as usize);
      (&mut *reader).take(length).read_to_end(&mut body).await?;
      if (body.len() as u64) < length {
        return Err(new_io_error(ErrorKind::UnexpectedEof, "eof inside message body"));
      }
      Ok(Bytes::from(body))
    }
    Framing::Chunked => read_chunked_body(reader, max).await,
    Framing::UntilClose => {
      let mut body = Vec::new();
      (&mut *reader)
        .take(max as u64 + 1)
        .read_to_end(&mut body)
        .await?;
      if body.len() > max {
        return Err(body_too_large(max));
      }
      Ok(Bytes::from(body))
    }
  }
}

async fn read_chunked_body<R>(reader: &mut R, max: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "eof inside chunk size"));
    }
    let size = parse_chunk_size(&line)?;
    if size == 0 {
      // trailers end at an empty line
      loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 || line == CR_LF || line == b"\n" {
          return Ok(Bytes::from(body));
        }
      }
    }
    let start = body.len();
    let end = (start as u64)
      .checked_add(size)
      .filter(|end| *end <= max as u64)
      .ok_or_else(|| body_too_large(max))?;
    body.resize(end as usize, 0);
    reader.read_exact(&mut body[start..]).await?;
    line.clear();
    reader.read_until(b'\n', &mut line).await?;
  }
}

/// Forward one body from `reader` to `writer` as it arrives, keeping its wire framing.
///
/// Every piece is flushed as soon as it is written, so streamed bodies (server-sent events,
/// long polls) reach the peer without waiting for the message to end. Returns the payload size.
pub(crate) async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: Framing) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  match framing {
    Framing::Empty => Ok(0),
    Framing::Length(length) => copy_exact(reader, writer, length).await,
    Framing::Chunked => copy_chunked(reader, writer).await,
    Framing::UntilClose => {
      let mut total = 0;
      loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
          return Ok(total);
        }
        let n = buf.len();
        writer.write_all(buf).await?;
        reader.consume(n);
        writer.flush().await?;
        total += n as u64;
      }
    }
  }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, length: u64) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut remaining = length;
  while remaining > 0 {
    let buf = reader.fill_buf().await?;
    if buf.is_empty() {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "eof inside message body"));
    }
    let n = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
    writer.write_all(&buf[..n]).await?;
    reader.consume(n);
    writer.flush().await?;
    remaining -= n as u64;
  }
  Ok(length)
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut total = 0u64;
  let mut line = Vec::new();
  loop {
    line.clear();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "eof inside chunk size"));
    }
    let size = parse_chunk_size(&line)?;
    writer.write_all(&line).await?;
    if size == 0 {
      loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        writer.write_all(&line).await?;
        if n == 0 || line == CR_LF || line == b"\n" {
          writer.flush().await?;
          return Ok(total);
        }
      }
    }
    copy_exact(reader, writer, size).await?;
    line.clear();
    reader.read_until(b'\n', &mut line).await?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    total = total.saturating_add(size);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn head_skips_leading_blank_lines() {
    let mut reader: &[u8] = b"\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\nrest";
    let head = read_head(&mut reader, 1024).await.unwrap().unwrap();
    assert_eq!(head, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    assert_eq!(reader, b"rest");
  }

  #[tokio::test]
  async fn head_limit_and_eof() {
    let mut reader: &[u8] = b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaa\r\n\r\n";
    assert!(matches!(
      read_head(&mut reader, 20).await,
      Err(Error::InvalidRequest(_))
    ));
    let mut empty: &[u8] = b"";
    assert!(read_head(&mut empty, 20).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn chunked_body_with_extensions_and_trailers() {
    let mut reader: &[u8] = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\nnext";
    let body = read_body(&mut reader, Framing::Chunked, 1024).await.unwrap();
    assert_eq!(&body[..], b"Wikipedia");
    assert_eq!(reader, b"next");
  }

  #[tokio::test]
  async fn short_length_body_is_an_error() {
    let mut reader: &[u8] = b"abc";
    assert!(read_body(&mut reader, Framing::Length(5), 1024).await.is_err());
  }

  #[tokio::test]
  async fn oversized_chunks_are_refused() {
    let mut reader: &[u8] = b"ffffffffffffffff\r\n";
    assert!(matches!(
      read_body(&mut reader, Framing::Chunked, 1024).await,
      Err(Error::InvalidRequest(_))
    ));
    // each chunk fits, the sum does not
    let mut reader: &[u8] = b"8\r\naaaaaaaa\r\n8\r\nbbbbbbbb\r\n0\r\n\r\n";
    assert!(matches!(
      read_body(&mut reader, Framing::Chunked, 12).await,
      Err(Error::InvalidRequest(_))
    ));
    let mut reader: &[u8] = b"12345678901234567\r\n";
    assert!(read_body(&mut reader, Framing::Chunked, 1024).await.is_err());
  }

  #[tokio::test]
  async fn declared_and_close_delimited_limits() {
    let mut reader: &[u8] = b"";
    assert!(matches!(
      read_body(&mut reader, Framing::Length(u64::MAX), 1024).await,
      Err(Error::InvalidRequest(_))
    ));
    let mut reader: &[u8] = b"0123456789";
    assert!(read_body(&mut reader, Framing::UntilClose, 4).await.is_err());
    let mut reader: &[u8] = b"0123";
    let body = read_body(&mut reader, Framing::UntilClose, 4).await.unwrap();
    assert_eq!(&body[..], b"0123");
  }

  #[tokio::test]
  async fn chunked_copy_keeps_wire_framing() {
    let wire: &[u8] = b"6;ext\r\ndata:1\r\n0\r\nX-Trailer: y\r\n\r\nnext";
    let mut reader = wire;
    let mut out = Vec::new();
    let copied = copy_body(&mut reader, &mut out, Framing::Chunked).await.unwrap();
    assert_eq!(copied, 6);
    assert_eq!(out, &wire[..wire.len() - 4]);
    assert_eq!(reader, b"next");
  }

  #[tokio::test]
  async fn streamed_chunk_arrives_before_body_ends() {
    let (mut origin, upstream) = tokio::io::duplex(1024);
    let (client, mut downstream) = tokio::io::duplex(1024);
    let relay = tokio::spawn(async move {
      let mut upstream = tokio::io::BufReader::new(upstream);
      let mut client = client;
      copy_body(&mut upstream, &mut client, Framing::Chunked).await
    });
    origin.write_all(b"6\r\ndata:1\r\n").await.unwrap();
    let mut first = [0u8; 11];
    tokio::time::timeout(
      std::time::Duration::from_secs(2),
      downstream.read_exact(&mut first),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&first, b"6\r\ndata:1\r\n");
    origin.write_all(b"0\r\n\r\n").await.unwrap();
    assert_eq!(relay.await.unwrap().unwrap(), 6);
  }

  #[test]
  fn connection_tokens() {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONNECTION, "keep-alive, Upgrade".parse().unwrap());
    assert!(header_has_token(&headers, http::header::CONNECTION, "upgrade"));
    assert!(keep_alive(http::Version::HTTP_10, &headers));
    headers.insert(http::header::CONNECTION, "close".parse().unwrap());
    assert!(!keep_alive(http::Version::HTTP_11, &headers));
  }
}
