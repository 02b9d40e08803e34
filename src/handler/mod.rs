//! Protocol handlers the dispatcher hands a classified connection to.

mod http;
mod tcp;
mod websocket;

pub use self::http::HttpRelay;
pub use self::tcp::{relay, TcpRelay};
pub use self::websocket::WebSocketRelay;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::Request;
use crate::Response;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// What the dispatcher should do once an HTTP handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
  /// More traffic follows that needs classifying again, such as a WebSocket upgrade
  Dispatch,
  /// The connection is finished
  Close,
}

/// Serves HTTP/1.x exchanges on a connection.
#[async_trait]
pub trait HttpHandler: Send + Sync {
  /// Relay requests until the connection closes or needs reclassifying.
  async fn handle(&self, ctx: &mut Context) -> Result<Next>;
}

/// Serves a WebSocket upgrade and the frames that follow it.
#[async_trait]
pub trait WsHandler: Send + Sync {
  /// Complete the upgrade and relay until either side closes.
  async fn handle(&self, ctx: &mut Context) -> Result<()>;
}

/// Serves traffic that is neither HTTP nor TLS.
#[async_trait]
pub trait TcpHandler: Send + Sync {
  /// Relay bytes in both directions until either side finishes.
  async fn handle(&self, ctx: &mut Context) -> Result<()>;
}

/// Point the connection at the host a request names.
///
/// Plain connections that send absolute-form targets may switch origin between requests; the
/// cached upstream is dropped when they do. Otherwise the request only fills in a destination
/// that is still unknown.
pub(crate) fn route(ctx: &mut Context, request: &Request) -> Result<()> {
  if !ctx.session.tls && request.uri().authority().is_some() {
    if let (Some(host), Some(port)) = (request.host(), request.port()) {
      let same = ctx.session.dst_host.as_deref() == Some(host.as_str()) && ctx.session.dst_port == port;
      if !same {
        ctx.set_destination(host, port);
        ctx.upstream = None;
      }
      return Ok(());
    }
  }
  if ctx.session.dst_host.is_none() {
    let host = request
      .host()
      .ok_or_else(|| Error::invalid_request(format!("no host for {}", request.uri())))?;
    let default_port = if ctx.session.tls { 443 } else { 80 };
    let port = request.port().unwrap_or(default_port);
    ctx.set_destination(host, port);
  }
  Ok(())
}

/// Send a response to the client leg.
pub(crate) async fn reply(ctx: &mut Context, response: &Response) -> Result<()> {
  ctx.stream.write_all(&response.to_raw()).await?;
  ctx.stream.flush().await?;
  Ok(())
}

/// Answer `400 Bad Request` for a request that cannot be served and hand back the error.
pub(crate) async fn bad_request(ctx: &mut Context, e: Error) -> Error {
  let response = Response::text(::http::StatusCode::BAD_REQUEST, format!("{}\n", e));
  // the client may already be gone
  let _ = reply(ctx, &response).await;
  e
}

/// Dial the origin if no leg is cached, answering `502 Bad Gateway` when that fails.
pub(crate) async fn ensure_upstream(ctx: &mut Context) -> Result<()> {
  if ctx.upstream.is_some() {
    return Ok(());
  }
  let dial = ctx.dial_upstream();
  match dial.await {
    Ok(stream) => {
      ctx.upstream = Some(crate::stream::PeekableStream::new(stream));
      Ok(())
    }
    Err(e) => {
      tracing::warn!(
        "[MITM] dial {} failed: {}",
        ctx.session.destination().unwrap_or_default(),
        e
      );
      let mut response = Response::text(
        ::http::StatusCode::BAD_GATEWAY,
        format!("upstream unavailable: {}\n", e),
      );
      response.headers_mut().insert(
        ::http::header::CONNECTION,
        ::http::HeaderValue::from_static("close"),
      );
      // the client may already be gone
      let _ = reply(ctx, &response).await;
      Err(e)
    }
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use crate::dialer::{DialOptions, Dialer};
  use crate::error::{Error, Result};
  use crate::stream::BoxStream;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Mutex};
  use tokio::io::DuplexStream;

  /// Hands out pre-made duplex streams instead of dialing; refuses once they run out.
  pub(crate) struct Pipes {
    pending: Mutex<Vec<DuplexStream>>,
    dials: AtomicUsize,
  }

  impl Pipes {
    pub(crate) fn new(streams: Vec<DuplexStream>) -> Arc<Pipes> {
      Arc::new(Pipes {
        pending: Mutex::new(streams),
        dials: AtomicUsize::new(0),
      })
    }

    pub(crate) fn dials(&self) -> usize {
      self.dials.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Dialer for Pipes {
    async fn dial(&self, _host: &str, _port: u16, _opts: &DialOptions) -> Result<BoxStream> {
      self.dials.fetch_add(1, Ordering::SeqCst);
      let stream = self
        .pending
        .lock()
        .unwrap()
        .pop()
        .ok_or_else(|| Error::connection_error("refused"))?;
      Ok(Box::new(stream))
    }
  }
}
