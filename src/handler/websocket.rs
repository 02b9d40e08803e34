use super::{bad_request, ensure_upstream, reply, route, WsHandler};
use crate::context::{Context, Protocol, Session};
use crate::error::{Error, Result};
use crate::hook::{Direction, Hooks, RequestOutcome};
use crate::{Request, Response};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// WebSocket relay.
///
/// The opening handshake is forwarded once through the request and response chains with
/// extension negotiation removed, so every frame that follows is plain and can be rewritten by
/// the WebSocket chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketRelay;

#[async_trait]
impl WsHandler for WebSocketRelay {
  async fn handle(&self, ctx: &mut Context) -> Result<()> {
    let config = ctx.config().clone();
    let max_head = config.max_head_size();
    let Some(mut request) = Request::read_from(&mut ctx.stream, max_head).await? else {
      return Ok(());
    };
    if let Err(e) = route(ctx, &request) {
      return Err(bad_request(ctx, e).await);
    }
    ctx.session.protocol = Protocol::WebSocket;
    request
      .headers_mut()
      .remove(::http::header::SEC_WEBSOCKET_EXTENSIONS);
    let session = ctx.session.clone();
    let request = match config.hooks().run_request(request, &session).await {
      RequestOutcome::Forward(request) => request,
      RequestOutcome::Respond(response) => return reply(ctx, &response).await,
      RequestOutcome::Drop => return Ok(()),
    };
    ensure_upstream(ctx).await?;
    let upstream = ctx
      .upstream
      .as_mut()
      .ok_or_else(|| Error::connection_error("upstream missing"))?;
    upstream.write_all(&request.to_raw()).await?;
    upstream.flush().await?;
    let response = Response::read_from(upstream, request.method(), max_head).await?;
    let response = config.hooks().run_response(response, &request, &session).await;
    reply(ctx, &response).await?;
    let switched = response.status_code() == ::http::StatusCode::SWITCHING_PROTOCOLS;
    ctx.request = Some(request);
    ctx.response = Some(response);
    if !switched {
      tracing::debug!(
        "[MITM] websocket upgrade to {} refused",
        session.destination().unwrap_or_default()
      );
      return Ok(());
    }
    let upstream = ctx
      .upstream
      .take()
      .ok_or_else(|| Error::connection_error("upstream missing"))?;
    tracing::debug!(
      "[MITM] websocket open to {}",
      session.destination().unwrap_or_default()
    );
    let client_ws = WebSocketStream::from_raw_socket(&mut ctx.stream, Role::Server, None).await;
    let upstream_ws = WebSocketStream::from_raw_socket(upstream, Role::Client, None).await;
    let (client_tx, client_rx) = client_ws.split();
    let (upstream_tx, upstream_rx) = upstream_ws.split();
    let token = CancellationToken::new();
    let (up, down) = tokio::join!(
      forward(
        client_rx,
        upstream_tx,
        Direction::Upstream,
        config.hooks(),
        &session,
        &token
      ),
      forward(
        upstream_rx,
        client_tx,
        Direction::Downstream,
        config.hooks(),
        &session,
        &token
      ),
    );
    up.and(down)
  }
}

/// Move messages from `rx` to `tx` until a close frame, an error or cancellation.
async fn forward<R, W>(
  mut rx: R,
  mut tx: W,
  direction: Direction,
  hooks: &Hooks,
  session: &Session,
  token: &CancellationToken,
) -> Result<()>
where
  R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
  W: Sink<Message, Error = WsError> + Unpin,
{
  let result = loop {
    let next = tokio::select! {
      _ = token.cancelled() => break Ok(()),
      next = rx.next() => next,
    };
    let msg = match next {
      Some(Ok(msg)) => msg,
      Some(Err(e)) => break Err(e),
      None => break Ok(()),
    };
    let closing = msg.is_close();
    let msg = hooks.run_websocket(msg, direction, session).await;
    if let Err(e) = tx.send(msg).await {
      break Err(e);
    }
    if closing {
      break Ok(());
    }
  };
  token.cancel();
  let _ = tx.close().await;
  match result.map_err(into_error) {
    Err(Some(e)) if !e.is_benign() => Err(e),
    Err(_) => {
      tracing::debug!("[MITM] websocket {:?} leg closed abruptly", direction);
      Ok(())
    }
    Ok(()) => Ok(()),
  }
}

/// `None` for the ways a peer can simply go away.
fn into_error(e: WsError) -> Option<Error> {
  match e {
    WsError::ConnectionClosed
    | WsError::AlreadyClosed
    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => None,
    WsError::Io(e) => Some(Error::Io(e)),
    other => Some(Error::connection_error(format!("websocket: {}", other))),
  }
}
