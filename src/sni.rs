//! Server Name Indication extraction from a TLS ClientHello.
//!
//! Parsing runs over peeked bytes only, so the ClientHello is still intact when the TLS acceptor
//! reads it afterwards.

use crate::stream::PeekableStream;
use tokio::io::AsyncRead;

/// TLS record header length.
const RECORD_HEADER_LEN: usize = 5;
/// Largest TLS plaintext record (2^14) plus its header.
const MAX_RECORD_LEN: usize = 16384 + RECORD_HEADER_LEN;

/// Outcome of looking for SNI in the first TLS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
  /// Server name found, lowercased and without a trailing dot.
  Found(String),
  /// A ClientHello without a server_name extension.
  NoSni,
  /// Not a TLS handshake record carrying a ClientHello.
  NotTls,
  /// Truncated or inconsistent ClientHello.
  Malformed,
}

impl SniResult {
  /// The server name, if one was found.
  pub fn into_name(self) -> Option<String> {
    match self {
      SniResult::Found(name) => Some(name),
      _ => None,
    }
  }
}

/// Peek the first TLS record off `stream` and parse its SNI.
///
/// Nothing is consumed. A stream that closes or errors mid-record yields `Malformed`.
pub async fn sniff_server_name<S>(stream: &mut PeekableStream<S>) -> SniResult
where
  S: AsyncRead + Unpin,
{
  let header = match stream.peek(RECORD_HEADER_LEN).await {
    Ok(header) => header,
    Err(_) => return SniResult::Malformed,
  };
  if header[0] != 0x16 {
    return SniResult::NotTls;
  }
  let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
  let total = (RECORD_HEADER_LEN + record_len).min(MAX_RECORD_LEN);
  match stream.peek(total).await {
    Ok(record) => parse_sni(record),
    Err(_) => SniResult::Malformed,
  }
}

/// Parse SNI from a buffer holding a TLS record with a ClientHello.
///
/// Layout walked here: record header (5), handshake type and length (4), client version (2),
/// random (32), session id, cipher suites, compression methods, then extensions.
pub fn parse_sni(data: &[u8]) -> SniResult {
  if data.len() < RECORD_HEADER_LEN + 4 {
    return SniResult::Malformed;
  }
  if data[0] != 0x16 {
    return SniResult::NotTls;
  }
  let handshake = &data[RECORD_HEADER_LEN..];
  if handshake[0] != 0x01 {
    return SniResult::NotTls;
  }
  let hello = &handshake[4..];
  if hello.len() < 34 {
    return SniResult::Malformed;
  }
  let mut pos = 34;

  // session id
  let Some(&session_len) = hello.get(pos) else {
    return SniResult::Malformed;
  };
  pos += 1 + session_len as usize;

  // cipher suites
  let Some(suites_len) = read_u16(hello, pos) else {
    return SniResult::Malformed;
  };
  pos += 2 + suites_len as usize;

  // compression methods
  let Some(&compression_len) = hello.get(pos) else {
    return SniResult::Malformed;
  };
  pos += 1 + compression_len as usize;

  let Some(extensions_len) = read_u16(hello, pos) else {
    return SniResult::NoSni;
  };
  pos += 2;
  let extensions_end = pos + extensions_len as usize;
  if extensions_end > hello.len() {
    return SniResult::Malformed;
  }

  while pos + 4 <= extensions_end {
    let (Some(ext_type), Some(ext_len)) = (read_u16(hello, pos), read_u16(hello, pos + 2)) else {
      return SniResult::Malformed;
    };
    pos += 4;
    let ext_end = pos + ext_len as usize;
    if ext_end > hello.len() {
      return SniResult::Malformed;
    }
    if ext_type == 0x0000 {
      return parse_server_name_extension(&hello[pos..ext_end]);
    }
    pos = ext_end;
  }
  SniResult::NoSni
}

fn parse_server_name_extension(data: &[u8]) -> SniResult {
  let Some(list_len) = read_u16(data, 0) else {
    return SniResult::Malformed;
  };
  let list_end = 2 + list_len as usize;
  if data.len() < list_end {
    return SniResult::Malformed;
  }
  let mut pos = 2;
  while pos + 3 <= list_end {
    let name_type = data[pos];
    let Some(name_len) = read_u16(data, pos + 1) else {
      return SniResult::Malformed;
    };
    pos += 3;
    let name_end = pos + name_len as usize;
    if name_end > list_end {
      return SniResult::Malformed;
    }
    // host_name
    if name_type == 0 {
      return match std::str::from_utf8(&data[pos..name_end]) {
        Ok(name) if !name.is_empty() => {
          SniResult::Found(name.to_ascii_lowercase().trim_end_matches('.').to_string())
        }
        _ => SniResult::Malformed,
      };
    }
    pos = name_end;
  }
  SniResult::NoSni
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
  let bytes = data.get(pos..pos + 2)?;
  Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
