use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::AsyncBufRead;

use crate::codec::{self, Framing};
use crate::config::DEFAULT_MAX_BODY_SIZE;
use crate::error::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An HTTP/1.x request as seen on an intercepted connection.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
  framing: Framing,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &format_args!("{}", self.body.escape_ascii()))
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Bytes>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: body.into(),
      framing: Framing::Empty,
    }
  }
}

impl Request {
  /// Creates a new builder-style object to manufacture a `Request`
  ///
  /// # Examples
  ///
  /// ```
  /// let request: slinger_mitm::Request = slinger_mitm::Request::builder()
  ///     .method("GET")
  ///     .uri("http://example.com/")
  ///     .body(bytes::Bytes::new())
  ///     .unwrap()
  ///     .into();
  /// assert_eq!(request.host().as_deref(), Some("example.com"));
  /// ```
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  /// Read one request (head and body) from `reader`.
  ///
  /// Returns `Ok(None)` when the peer closed the connection between requests. Chunked bodies are
  /// decoded; [`Request::to_raw`] re-frames them with a `Content-Length`. Bodies over
  /// [`DEFAULT_MAX_BODY_SIZE`] are refused.
  pub async fn read_from<R>(reader: &mut R, max_head: usize) -> Result<Option<Request>>
  where
    R: AsyncBufRead + Unpin,
  {
    let Some(mut request) = Request::read_head(reader, max_head).await? else {
      return Ok(None);
    };
    request.read_body(reader, DEFAULT_MAX_BODY_SIZE).await?;
    Ok(Some(request))
  }

  /// Read only the head, leaving the body on `reader` for [`Request::read_body`] or a streamed
  /// copy.
  pub(crate) async fn read_head<R>(reader: &mut R, max_head: usize) -> Result<Option<Request>>
  where
    R: AsyncBufRead + Unpin,
  {
    let Some(head) = codec::read_head(reader, max_head).await? else {
      return Ok(None);
    };
    let mut request = Request::parse_head(&head)?;
    request.framing = codec::framing_from_headers(&request.headers, Framing::Empty)?;
    Ok(Some(request))
  }

  /// Buffer the body announced by the head, up to `max` bytes.
  pub(crate) async fn read_body<R>(&mut self, reader: &mut R, max: usize) -> Result<()>
  where
    R: AsyncBufRead + Unpin,
  {
    self.body = codec::read_body(reader, self.framing, max).await?;
    self.framing = Framing::Empty;
    Ok(())
  }

  /// Framing of a body still waiting on the wire.
  pub(crate) fn framing(&self) -> Framing {
    self.framing
  }

  /// `Expect: 100-continue` on a request that has a body to send.
  pub(crate) fn expects_continue(&self) -> bool {
    !matches!(self.framing, Framing::Empty | Framing::Length(0))
      && codec::header_has_token(&self.headers, http::header::EXPECT, "100-continue")
  }

  /// Parse a complete request head, without a body.
  pub(crate) fn parse_head(head: &[u8]) -> Result<Request> {
    let (start, lines) = codec::split_head(head);
    let mut parts = start.split(|b| *b == b' ').filter(|p| !p.is_empty());
    let (Some(method), Some(target), Some(version), None) =
      (parts.next(), parts.next(), parts.next(), parts.next())
    else {
      return Err(Error::invalid_request(format!(
        "invalid request line {}",
        start.escape_ascii()
      )));
    };
    let method = Method::from_bytes(method).map_err(|e| Error::Http(http::Error::from(e)))?;
    let uri = http::Uri::try_from(target).map_err(|e| Error::Http(http::Error::from(e)))?;
    let version = codec::parse_version(version)?;
    let headers = codec::parse_headers(lines)?;
    Ok(Request {
      uri,
      version,
      method,
      headers,
      body: Bytes::new(),
      framing: Framing::Empty,
    })
  }

  /// Serialize for the upstream leg.
  ///
  /// Absolute-form targets are written in origin-form, `Host` is filled in from the URI when
  /// missing, and the body is always sent with an exact `Content-Length`.
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = self.raw_head(Some(self.body.len()));
    http_requests.extend(self.body.as_ref());
    Bytes::from(http_requests)
  }

  /// The head alone, framing headers untouched, for a body streamed right behind it.
  pub(crate) fn head_to_raw(&self) -> Bytes {
    Bytes::from(self.raw_head(None))
  }

  fn raw_head(&self, content_length: Option<usize>) -> Vec<u8> {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    if self.method == Method::CONNECT {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(authority.as_str().as_bytes());
      }
    } else {
      match self.uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => http_requests.extend(pq.as_str().as_bytes()),
        _ => http_requests.extend(b"/"),
      }
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(http::header::HOST.as_str().as_bytes());
        http_requests.extend(COLON_SPACE);
        http_requests.extend(authority.as_str().as_bytes());
        http_requests.extend(CR_LF);
      }
    }
    let mut headers = self.headers.clone();
    if let Some(length) = content_length {
      headers.remove(http::header::TRANSFER_ENCODING);
      if length > 0 || headers.contains_key(http::header::CONTENT_LENGTH) {
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(length));
      }
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    http_requests
  }
}

impl Request {
  /// The HTTP method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Mutable access to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// The request target as sent by the client.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Mutable access to the request target.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// The request headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Mutable access to the request headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// The decoded request body.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Mutable access to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Bytes {
    &mut self.body
  }
  /// The HTTP version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Mutable access to the HTTP version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }

  /// Target host, from the URI authority or else the `Host` header, without a port.
  pub fn host(&self) -> Option<String> {
    if let Some(host) = self.uri.host() {
      return Some(strip_brackets(host).to_string());
    }
    let value = self.headers.get(http::header::HOST)?.to_str().ok()?;
    let authority = value.parse::<http::uri::Authority>().ok()?;
    Some(strip_brackets(authority.host()).to_string())
  }

  /// Target port from the URI authority or else the `Host` header, if one is spelled out.
  pub fn port(&self) -> Option<u16> {
    if let Some(port) = self.uri.port_u16() {
      return Some(port);
    }
    if self.uri.authority().is_some() {
      return match self.uri.scheme_str() {
        Some("https") | Some("wss") => Some(443),
        Some("http") | Some("ws") => Some(80),
        _ => None,
      };
    }
    let value = self.headers.get(http::header::HOST)?.to_str().ok()?;
    value.parse::<http::uri::Authority>().ok()?.port_u16()
  }

  /// The `Content-Type` header as a string.
  pub fn content_type(&self) -> Option<&str> {
    self
      .headers
      .get(http::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
  }

  /// Whether the client wants the connection kept open after this exchange.
  pub fn keep_alive(&self) -> bool {
    codec::keep_alive(self.version, &self.headers)
  }

  /// A WebSocket opening handshake: `Connection: upgrade` plus `Upgrade: websocket`.
  pub fn is_websocket_upgrade(&self) -> bool {
    self.method == Method::GET
      && codec::header_has_token(&self.headers, http::header::CONNECTION, "upgrade")
      && codec::header_has_token(&self.headers, http::header::UPGRADE, "websocket")
  }
}

fn strip_brackets(host: &str) -> &str {
  host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host)
}
