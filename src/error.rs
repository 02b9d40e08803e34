//! Error types for the MITM proxy core

use std::io;
use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for MITM proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// The front-end proxy handshake was malformed or unsupported
  #[error("Negotiation error: {0}")]
  Negotiation(String),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP construction error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Malformed HTTP message on the wire
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Upstream proxy refused or broke the tunnel
  #[error("Proxy error: {0}")]
  Proxy(String),

  /// SOCKS5 upstream reply error
  #[error("SOCKS5 reply: {0}")]
  ReplyError(#[from] ReplyError),

  /// Connection error
  #[error("Connection error: {0}")]
  Connection(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

/// SOCKS5 reply codes other than success.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  /// `0x01`
  #[error("General failure")]
  GeneralFailure,
  /// `0x02`
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  /// `0x03`
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// `0x04`
  #[error("Host unreachable")]
  HostUnreachable,
  /// `0x05`
  #[error("Connection refused")]
  ConnectionRefused,
  /// `0x06`
  #[error("TTL expired")]
  TtlExpired,
  /// `0x07`
  #[error("Command not supported")]
  CommandNotSupported,
  /// `0x08`
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  /// Any other code
  #[error("Unknown reply code {0:#04x}")]
  Unknown(u8),
}

impl Error {
  /// Create a negotiation error
  pub fn negotiation(msg: impl Into<String>) -> Self {
    Error::Negotiation(msg.into())
  }

  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a proxy error
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    Error::Proxy(msg.into())
  }

  /// Create an invalid request error
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }

  /// Create a connection error
  pub fn connection_error(msg: impl Into<String>) -> Self {
    Error::Connection(msg.into())
  }

  /// Create an other error
  pub fn other(msg: impl Into<String>) -> Self {
    Error::Other(msg.into())
  }

  /// Whether this error is an ordinary end of a connection rather than a failure.
  ///
  /// EOF, resets, aborts and broken pipes fall in this class and are logged at debug level.
  pub fn is_benign(&self) -> bool {
    match self {
      Error::Io(e) => is_eof(e) || is_conn_reset(e) || is_conn_aborted(e),
      _ => false,
    }
  }
}

/// End of stream, expected or not.
pub fn is_eof(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::UnexpectedEof
}

/// Peer reset the connection or the pipe went away under a write.
pub fn is_conn_reset(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
  )
}

/// Local side aborted the connection.
pub fn is_conn_aborted(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::ConnectionAborted
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::tls_error(value.to_string())
  }
}

impl From<u8> for ReplyError {
  fn from(value: u8) -> Self {
    match value {
      0x01 => ReplyError::GeneralFailure,
      0x02 => ReplyError::ConnectionNotAllowed,
      0x03 => ReplyError::NetworkUnreachable,
      0x04 => ReplyError::HostUnreachable,
      0x05 => ReplyError::ConnectionRefused,
      0x06 => ReplyError::TtlExpired,
      0x07 => ReplyError::CommandNotSupported,
      0x08 => ReplyError::AddressTypeNotSupported,
      other => ReplyError::Unknown(other),
    }
  }
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}
