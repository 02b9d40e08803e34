//! Protocol classification.
//!
//! After the front handshake the dispatcher peeks at the stream and decides what it carries. TLS
//! is taken over with a forged certificate and the decrypted stream is classified again, so
//! HTTP, WebSocket and opaque traffic are handled the same way with or without encryption.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::Next;
use crate::matcher::is_domain;
use crate::negotiator::accept_connect;
use crate::sni::sniff_server_name;
use crate::stream::PeekableStream;
use crate::Request;
use async_trait::async_trait;
use std::io::ErrorKind;
use tokio_rustls::TlsAcceptor;

/// First three bytes of every method the HTTP handlers understand.
const HTTP_METHOD_PREFIXES: [&[u8; 3]; 9] = [
  b"GET", b"HEA", b"POS", b"PUT", b"PAT", b"DEL", b"OPT", b"TRA", b"CON",
];

/// Owns a connection after negotiation and routes it to a handler.
#[async_trait]
pub trait Dispatcher: Send + Sync {
  /// Classify and serve the connection until it ends.
  async fn dispatch(&self, ctx: Context) -> Result<()>;
}

/// Default dispatcher: TLS takeover, then HTTP, WebSocket or opaque TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolDispatcher;

#[derive(Debug)]
enum Route {
  Closed,
  Tls,
  Connect,
  Http(Option<String>),
  WebSocket(Option<String>),
  Tcp,
}

#[async_trait]
impl Dispatcher for ProtocolDispatcher {
  async fn dispatch(&self, mut ctx: Context) -> Result<()> {
    let config = ctx.config().clone();
    loop {
      match classify(&mut ctx).await? {
        Route::Closed => return Ok(()),
        Route::Tls => match resolve_server_name(&mut ctx).await {
          Some(name) => ctx = take_over(ctx, name).await?,
          None => {
            tracing::debug!("[MITM] no server name for TLS, passing through");
            return config.tcp_handler().handle(&mut ctx).await;
          }
        },
        Route::Connect => accept_connect(&mut ctx).await?,
        Route::Http(host) => {
          remember_names(&mut ctx, host).await;
          match config.http_handler().handle(&mut ctx).await? {
            Next::Dispatch => continue,
            Next::Close => return Ok(()),
          }
        }
        Route::WebSocket(host) => {
          remember_names(&mut ctx, host).await;
          return config.ws_handler().handle(&mut ctx).await;
        }
        Route::Tcp => return config.tcp_handler().handle(&mut ctx).await,
      }
    }
  }
}

/// Decide what the next bytes on the client stream are, without consuming them.
async fn classify(ctx: &mut Context) -> Result<Route> {
  let max_head = ctx.config().max_head_size();
  let tls_record = match ctx.stream.peek(2).await {
    Ok(prefix) => prefix == [0x16, 0x03],
    Err(e) if e.is_clean_eof() => return Ok(Route::Closed),
    Err(e) if e.io().kind() == ErrorKind::UnexpectedEof => return Ok(Route::Tcp),
    Err(e) => return Err(e.into()),
  };
  if tls_record && !ctx.session.tls {
    return Ok(Route::Tls);
  }
  let is_http = match ctx.stream.peek(3).await {
    Ok(prefix) => HTTP_METHOD_PREFIXES.iter().any(|m| m[..] == *prefix),
    Err(e) if e.io().kind() == ErrorKind::UnexpectedEof => false,
    Err(e) => return Err(e.into()),
  };
  if !is_http {
    return Ok(Route::Tcp);
  }
  let request = match ctx.stream.peek_until(b"\r\n\r\n", max_head).await {
    Ok(Some(head)) => Request::parse_head(head).ok(),
    Ok(None) => None,
    Err(e) if e.io().kind() == ErrorKind::UnexpectedEof => None,
    Err(e) => return Err(e.into()),
  };
  let Some(request) = request else {
    return Ok(Route::Tcp);
  };
  if request.is_websocket_upgrade() {
    Ok(Route::WebSocket(request.host()))
  } else if request.method() == http::Method::CONNECT {
    Ok(Route::Connect)
  } else {
    Ok(Route::Http(request.host()))
  }
}

/// Pick the name to forge a certificate for, or `None` to give up on interception.
async fn resolve_server_name(ctx: &mut Context) -> Option<String> {
  let config = ctx.config().clone();
  if let Some(host) = ctx.session.dst_host.clone() {
    if is_domain(&host) {
      return Some(host);
    }
    if let Some(domain) = config.name_cache().get_ptr(&host).await {
      tracing::debug!("[MITM] {} known as {}", host, domain);
      return Some(domain);
    }
  }
  if let Some(sni) = sniff_server_name(&mut ctx.stream).await.into_name() {
    if ctx.session.dst_host.is_none() {
      ctx.set_destination(sni.clone(), 443);
    }
    ctx.sniffed_sni = Some(sni.clone());
    return Some(sni);
  }
  if let Some(san) = config.default_san() {
    tracing::warn!("[MITM] no SNI provided, using fallback certificate for {}", san);
    return Some(san.to_string());
  }
  None
}

/// Terminate the client's TLS with a certificate for `server_name` and continue on plaintext.
async fn take_over(mut ctx: Context, server_name: String) -> Result<Context> {
  let server_config = ctx
    .config()
    .issuer()
    .server_config(&server_name)
    .await?;
  let acceptor = TlsAcceptor::from(server_config);
  // the peeked ClientHello is replayed to the acceptor
  let tls = acceptor
    .accept(ctx.stream)
    .await
    .map_err(|e| Error::tls_error(format!("handshake for {}: {}", server_name, e)))?;
  ctx.stream = PeekableStream::new(Box::new(tls));
  ctx.session.tls = true;
  tracing::debug!("[MITM] TLS taken over as {}", server_name);
  ctx.session.server_name = Some(server_name);
  Ok(ctx)
}

/// Cache what SNI sniffing taught us about this destination, once.
async fn remember_names(ctx: &mut Context, request_host: Option<String>) {
  let Some(sni) = ctx.sniffed_sni.take() else {
    return;
  };
  let cache = ctx.config().name_cache().clone();
  let ip = ctx.session.dst_host.clone().filter(|h| !is_domain(h));
  if let Some(ip) = ip {
    cache.set_ptr(&ip, &sni).await;
  }
  let domain = request_host.unwrap_or_else(|| sni.clone());
  cache.set_sni(&domain, &sni).await;
}
