//! Front-end proxy handshakes.
//!
//! A negotiator consumes exactly one handshake from the client and records the destination it
//! names. Payload bytes that follow are left for the dispatcher.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::socks5;
use crate::Request;
use async_trait::async_trait;
use http::Method;
use std::io::ErrorKind;
use tokio::io::AsyncWriteExt;

/// Handshake strategy run once per accepted connection, before protocol dispatch.
#[async_trait]
pub trait Negotiator: Send + Sync {
  /// Consume the handshake, if any, and fill in the destination.
  async fn handshake(&self, ctx: &mut Context) -> Result<()>;
}

/// No handshake; the destination comes from the traffic itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transparent;

#[async_trait]
impl Negotiator for Transparent {
  async fn handshake(&self, _ctx: &mut Context) -> Result<()> {
    Ok(())
  }
}

/// HTTP `CONNECT` tunnel requests. Anything else passes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnect;

#[async_trait]
impl Negotiator for HttpConnect {
  async fn handshake(&self, ctx: &mut Context) -> Result<()> {
    match ctx.stream.peek(3).await {
      Ok(prefix) if prefix == b"CON" => {}
      Ok(_) => return Ok(()),
      // too short to be CONNECT; the dispatcher sees the same bytes
      Err(e) if e.io().kind() == ErrorKind::UnexpectedEof => return Ok(()),
      Err(e) => return Err(e.into()),
    }
    accept_connect(ctx).await
  }
}

/// Read a `CONNECT` request off the client stream, record its target and confirm the tunnel.
pub(crate) async fn accept_connect(ctx: &mut Context) -> Result<()> {
  let max_head = ctx.config().max_head_size();
  let request = Request::read_from(&mut ctx.stream, max_head)
    .await?
    .ok_or_else(|| Error::negotiation("connection closed inside CONNECT"))?;
  if request.method() != Method::CONNECT {
    return Err(Error::negotiation(format!(
      "expected CONNECT, got {}",
      request.method()
    )));
  }
  let host = request
    .host()
    .ok_or_else(|| Error::negotiation(format!("CONNECT without host: {}", request.uri())))?;
  let port = request.uri().port_u16().unwrap_or(443);
  tracing::debug!("[MITM] CONNECT {}:{}", host, port);
  ctx.set_destination(host, port);
  let reply = format!("{:?} 200 Connection established\r\n\r\n", request.version());
  ctx.stream.write_all(reply.as_bytes()).await?;
  ctx.stream.flush().await?;
  Ok(())
}

/// SOCKS5 `CONNECT` without authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct Socks5;

#[async_trait]
impl Negotiator for Socks5 {
  async fn handshake(&self, ctx: &mut Context) -> Result<()> {
    let target = socks5::accept(&mut ctx.stream).await?;
    tracing::debug!("[MITM] SOCKS5 CONNECT {}", target);
    ctx.set_destination(target.host(), target.port());
    Ok(())
  }
}

/// SOCKS5 when the first byte is `0x05`, HTTP `CONNECT` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mixed;

#[async_trait]
impl Negotiator for Mixed {
  async fn handshake(&self, ctx: &mut Context) -> Result<()> {
    let first = match ctx.stream.peek(1).await {
      Ok(first) => first[0],
      Err(e) if e.is_clean_eof() => return Ok(()),
      Err(e) => return Err(e.into()),
    };
    if first == socks5::consts::SOCKS5_VERSION {
      Socks5.handshake(ctx).await
    } else {
      HttpConnect.handshake(ctx).await
    }
  }
}
