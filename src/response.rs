use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::{HeaderValue, Method, Response as HttpResponse, StatusCode};
use tokio::io::AsyncBufRead;

use crate::codec::{self, Framing};
use crate::config::DEFAULT_MAX_BODY_SIZE;
use crate::error::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An HTTP/1.x response travelling back to the client.
#[derive(Default, Clone)]
pub struct Response {
  version: http::Version,
  status_code: StatusCode,
  headers: http::HeaderMap<HeaderValue>,
  body: Bytes,
  // framing carried over from the wire
  bodiless: bool,
  close_delimited: bool,
  framing: Framing,
}

impl Debug for Response {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Response")
      .field("version", &self.version)
      .field("status_code", &self.status_code)
      .field("headers", &self.headers)
      .field("body", &format_args!("{}", self.body.escape_ascii()))
      .finish()
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Bytes>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      body: body.into(),
      bodiless: false,
      close_delimited: false,
      framing: Framing::Empty,
    }
  }
}

impl Response {
  /// An HTTP response builder
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern, for example to answer a request from a hook.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// A minimal response with the given status and plain-text body.
  pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Response {
    let mut headers = http::HeaderMap::new();
    headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Response {
      version: http::Version::HTTP_11,
      status_code: status,
      headers,
      body: body.into(),
      bodiless: false,
      close_delimited: false,
      framing: Framing::Empty,
    }
  }

  /// Read one response answering a `method` request from `reader`.
  ///
  /// HEAD responses, successful CONNECT replies and 1xx/204/304 statuses carry no body. Without
  /// `Content-Length` or chunked encoding the body runs until the upstream closes. Bodies over
  /// [`DEFAULT_MAX_BODY_SIZE`] are refused.
  pub async fn read_from<R>(reader: &mut R, method: &Method, max_head: usize) -> Result<Response>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut response = Response::read_head(reader, method, max_head).await?;
    response.read_body(reader, DEFAULT_MAX_BODY_SIZE).await?;
    Ok(response)
  }

  /// Read only the head and work out how the body that follows is framed.
  pub(crate) async fn read_head<R>(reader: &mut R, method: &Method, max_head: usize) -> Result<Response>
  where
    R: AsyncBufRead + Unpin,
  {
    let head = codec::read_head(reader, max_head).await?.ok_or_else(|| {
      new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "upstream closed before responding",
      )
    })?;
    let mut response = Response::parse_head(&head)?;
    let status = response.status_code;
    response.bodiless = method == Method::HEAD
      || (method == Method::CONNECT && status.is_success())
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED;
    response.framing = if response.bodiless {
      Framing::Empty
    } else {
      codec::framing_from_headers(&response.headers, Framing::UntilClose)?
    };
    response.close_delimited = response.framing == Framing::UntilClose;
    Ok(response)
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

  /// A 1xx answer that a final response still follows.
  pub(crate) fn is_interim(&self) -> bool {
    self.status_code.is_informational() && self.status_code != StatusCode::SWITCHING_PROTOCOLS
  }

  pub(crate) fn parse_head(head: &[u8]) -> Result<Response> {
    let (start, lines) = codec::split_head(head);
    let mut parts = start.splitn(3, |b| *b == b' ');
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
      return Err(Error::invalid_request(format!(
        "invalid status line {}",
        start.escape_ascii()
      )));
    };
    let version = codec::parse_version(version)?;
    let status_code =
      StatusCode::from_bytes(status).map_err(|e| Error::Http(http::Error::from(e)))?;
    let headers = codec::parse_headers(lines)?;
    Ok(Response {
      version,
      status_code,
      headers,
      body: Bytes::new(),
      bodiless: false,
      close_delimited: false,
      framing: Framing::Empty,
    })
  }

  /// Serialize for the client leg.
  ///
  /// Bodies are sent with an exact `Content-Length`. Responses that carry no body by definition
  /// keep their headers untouched.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = self.raw_head(true);
    if !self.bodiless {
      http_response.extend(self.body.as_ref());
    }
    Bytes::from(http_response)
  }

  /// The head alone, framing headers untouched, for a body streamed right behind it.
  pub(crate) fn head_to_raw(&self) -> Bytes {
    Bytes::from(self.raw_head(false))
  }

  fn raw_head(&self, reframe: bool) -> Vec<u8> {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(
      self
        .status_code
        .canonical_reason()
        .unwrap_or_default()
        .as_bytes(),
    );
    http_response.extend(CR_LF);
    let mut headers = self.headers.clone();
    if reframe && !self.bodiless {
      headers.remove(http::header::TRANSFER_ENCODING);
      headers.insert(
        http::header::CONTENT_LENGTH,
        HeaderValue::from(self.body.len()),
      );
    }
    for (k, v) in headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    http_response
  }
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Mutable access to the status code.
  #[inline]
  pub fn status_code_mut(&mut self) -> &mut StatusCode {
    &mut self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the decoded response body.
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Replace or edit the body; framing is recomputed on serialization.
  pub fn body_mut(&mut self) -> &mut Bytes {
    &mut self.body
  }
  /// The `Content-Type` header as a string.
  pub fn content_type(&self) -> Option<&str> {
    self
      .headers
      .get(http::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
  }
  /// Whether the upstream connection can carry another request after this response.
  pub fn keep_alive(&self) -> bool {
    !self.close_delimited && codec::keep_alive(self.version, &self.headers)
  }
}
