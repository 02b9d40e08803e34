use super::TcpHandler;
use crate::context::{Context, Protocol, Session};
use crate::error::{Error, Result};
use crate::hook::{Direction, Hooks};
use crate::stream::PeekableStream;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Byte relay for traffic no other handler understands.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpRelay;

#[async_trait]
impl TcpHandler for TcpRelay {
  async fn handle(&self, ctx: &mut Context) -> Result<()> {
    ctx.session.protocol = Protocol::Tcp;
    if ctx.session.dst_host.is_none() {
      return Err(Error::connection_error(
        "opaque traffic without a known destination",
      ));
    }
    let upstream = match ctx.upstream.take() {
      Some(upstream) => upstream,
      None => PeekableStream::new(ctx.dial_upstream().await?),
    };
    tracing::debug!(
      "[MITM] relaying {} bytes stream to {}",
      if ctx.session.tls { "decrypted" } else { "raw" },
      ctx.session.destination().unwrap_or_default()
    );
    let config = ctx.config().clone();
    let session = ctx.session.clone();
    relay(&mut ctx.stream, upstream, config.hooks(), &session).await
  }
}

/// Copy bytes both ways between `client` and `upstream`, passing each chunk through the raw chain.
///
/// The first side to finish, cleanly or not, cancels the other. Benign disconnects count as a
/// clean finish; otherwise the first failure is returned.
pub async fn relay<C, U>(client: C, upstream: U, hooks: &Hooks, session: &Session) -> Result<()>
where
  C: AsyncRead + AsyncWrite + Unpin,
  U: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_rd, mut client_wr) = tokio::io::split(client);
  let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
  let token = CancellationToken::new();
  let (up, down) = tokio::join!(
    pump(
      &mut client_rd,
      &mut upstream_wr,
      Direction::Upstream,
      hooks,
      session,
      &token
    ),
    pump(
      &mut upstream_rd,
      &mut client_wr,
      Direction::Downstream,
      hooks,
      session,
      &token
    ),
  );
  up.and(down)
}

async fn pump<R, W>(
  reader: &mut R,
  writer: &mut W,
  direction: Direction,
  hooks: &Hooks,
  session: &Session,
  token: &CancellationToken,
) -> Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
  let result: Result<()> = async {
    loop {
      let n = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        n = reader.read(&mut buf) => n?,
      };
      if n == 0 {
        return Ok(());
      }
      let data = Bytes::copy_from_slice(&buf[..n]);
      let data = hooks.run_raw(data, direction, session).await;
      writer.write_all(&data).await?;
      writer.flush().await?;
    }
  }
  .await;
  token.cancel();
  let _ = writer.shutdown().await;
  match result {
    Err(e) if e.is_benign() => {
      tracing::debug!("[MITM] {:?} relay closed: {}", direction, e);
      Ok(())
    }
    other => other,
  }
}
