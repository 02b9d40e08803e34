use super::{bad_request, ensure_upstream, reply, route, HttpHandler, Next};
use crate::codec;
use crate::context::{Context, Protocol};
use crate::error::{Error, Result};
use crate::hook::RequestOutcome;
use crate::{Request, Response};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// Keep-alive HTTP/1.x relay.
///
/// Each request goes through the request chain, is sent over one lazily dialed upstream and the
/// answer goes through the response chain. The upstream is reused while the origin keeps it open.
/// Bodies are buffered only for messages a hook applies to; all others are streamed as they
/// arrive.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpRelay;

#[async_trait]
impl HttpHandler for HttpRelay {
  async fn handle(&self, ctx: &mut Context) -> Result<Next> {
    let config = ctx.config().clone();
    let hooks = config.hooks();
    let max_head = config.max_head_size();
    let max_body = config.max_body_size();
    loop {
      // an upgrade mid-connection goes back through classification
      match ctx.stream.peek_until(b"\r\n\r\n", max_head).await {
        Ok(Some(head)) => {
          if Request::parse_head(head).is_ok_and(|r| r.is_websocket_upgrade()) {
            return Ok(Next::Dispatch);
          }
        }
        Ok(None) => {}
        Err(e) if e.is_clean_eof() => return Ok(Next::Close),
        Err(e) => return Err(e.into()),
      }
      let Some(mut request) = Request::read_head(&mut ctx.stream, max_head).await? else {
        return Ok(Next::Close);
      };
      if let Err(e) = route(ctx, &request) {
        return Err(bad_request(ctx, e).await);
      }
      ctx.session.protocol = Protocol::Http;
      tracing::debug!(
        "[MITM] {} {} via {}",
        request.method(),
        request.uri(),
        ctx.session.destination().unwrap_or_default()
      );
      if request.expects_continue() {
        // the body is pulled from the client right away, so the go-ahead is given here
        request.headers_mut().remove(::http::header::EXPECT);
        ctx.stream.write_all(CONTINUE).await?;
        ctx.stream.flush().await?;
      }
      let client_keep_alive = request.keep_alive();
      let session = ctx.session.clone();
      let buffered = hooks.intercepts_request(&request, &session);
      if buffered {
        if let Err(e) = request.read_body(&mut ctx.stream, max_body).await {
          return Err(bad_request(ctx, e).await);
        }
        request = match hooks.run_request(request, &session).await {
          RequestOutcome::Forward(request) => request,
          RequestOutcome::Respond(response) => {
            reply(ctx, &response).await?;
            if client_keep_alive && response.keep_alive() {
              continue;
            }
            return Ok(Next::Close);
          }
          RequestOutcome::Drop => {
            tracing::debug!("[MITM] request dropped by hook");
            return Ok(Next::Close);
          }
        };
      }
      ensure_upstream(ctx).await?;
      let upstream = ctx
        .upstream
        .as_mut()
        .ok_or_else(|| Error::connection_error("upstream missing"))?;
      if buffered {
        upstream.write_all(&request.to_raw()).await?;
      } else {
        upstream.write_all(&request.head_to_raw()).await?;
        codec::copy_body(&mut ctx.stream, upstream, request.framing()).await?;
      }
      upstream.flush().await?;

      let mut response = loop {
        let response = Response::read_head(upstream, request.method(), max_head).await?;
        if !response.is_interim() {
          break response;
        }
        ctx.stream.write_all(&response.head_to_raw()).await?;
        ctx.stream.flush().await?;
      };
      if hooks.intercepts_response(&response, &request, &session) {
        response.read_body(upstream, max_body).await?;
        response = hooks.run_response(response, &request, &session).await;
        ctx.stream.write_all(&response.to_raw()).await?;
      } else {
        ctx.stream.write_all(&response.head_to_raw()).await?;
        ctx.stream.flush().await?;
        codec::copy_body(upstream, &mut ctx.stream, response.framing()).await?;
      }
      ctx.stream.flush().await?;

      let upstream_keep_alive = response.keep_alive();
      if !upstream_keep_alive {
        ctx.upstream = None;
      }
      ctx.request = Some(request);
      ctx.response = Some(response);
      if !client_keep_alive || !upstream_keep_alive {
        return Ok(Next::Close);
      }
    }
  }
}

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ConfigBuilder;
  use crate::context::Session;
  use crate::handler::testing::Pipes;
  use crate::stream::PeekableStream;
  use std::sync::Arc;
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, DuplexStream};

  async fn read_response(reader: &mut PeekableStream<DuplexStream>) -> String {
    let response = Response::read_from(reader, &http::Method::GET, 8192)
      .await
      .unwrap();
    format!("{} {}", response.status_code().as_u16(), response.body().escape_ascii())
  }

  #[tokio::test]
  async fn keep_alive_reuses_one_upstream() {
    let (origin, upstream) = tokio::io::duplex(4096);
    let pipes = Pipes::new(vec![upstream]);
    let config = ConfigBuilder::new().dialer(pipes.clone()).build().unwrap();
    let (mut client, server) = tokio::io::duplex(4096);
    let mut ctx = Context::new(Box::new(server), None, Arc::new(config));

    let origin_task = tokio::spawn(async move {
      let mut origin = PeekableStream::new(origin);
      for body in ["one", "two"] {
        let request = Request::read_from(&mut origin, 8192).await.unwrap().unwrap();
        assert_eq!(request.uri().path(), format!("/{}", body));
        let reply = format!("HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n{}", body);
        origin.write_all(reply.as_bytes()).await.unwrap();
      }
    });

    client
      .write_all(b"GET /one HTTP/1.1\r\nHost: example.com\r\n\r\nGET /two HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();
    let next = HttpRelay.handle(&mut ctx).await.unwrap();
    assert_eq!(next, Next::Close);
    origin_task.await.unwrap();
    let mut client = PeekableStream::new(client);
    assert_eq!(read_response(&mut client).await, "200 one");
    assert_eq!(read_response(&mut client).await, "200 two");
    assert_eq!(pipes.dials(), 1);
    assert_eq!(ctx.session.dst_host.as_deref(), Some("example.com"));
    assert_eq!(ctx.session.dst_port, 80);
  }

  #[tokio::test]
  async fn dial_failure_answers_bad_gateway() {
    let pipes = Pipes::new(Vec::new());
    let config = ConfigBuilder::new().dialer(pipes).build().unwrap();
    let (mut client, server) = tokio::io::duplex(4096);
    let mut ctx = Context::new(Box::new(server), None, Arc::new(config));
    client
      .write_all(b"GET / HTTP/1.1\r\nHost: down.example\r\n\r\n")
      .await
      .unwrap();
    assert!(HttpRelay.handle(&mut ctx).await.is_err());
    drop(ctx);
    let mut raw = String::new();
    client.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
  }

  #[tokio::test]
  async fn close_delimited_response_drops_upstream() {
    let (origin, upstream) = tokio::io::duplex(4096);
    let pipes = Pipes::new(vec![upstream]);
    let config = ConfigBuilder::new().dialer(pipes).build().unwrap();
    let (mut client, server) = tokio::io::duplex(4096);
    let mut ctx = Context::new(Box::new(server), None, Arc::new(config));
    tokio::spawn(async move {
      let mut origin = PeekableStream::new(origin);
      let _ = Request::read_from(&mut origin, 8192).await.unwrap();
      origin.write_all(b"HTTP/1.1 200 OK\r\n\r\nstreamed").await.unwrap();
    });
    client
      .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
      .await
      .unwrap();
    assert_eq!(HttpRelay.handle(&mut ctx).await.unwrap(), Next::Close);
    assert!(ctx.upstream.is_none());
    // the body ends when the client leg closes
    drop(ctx);
    let mut client = PeekableStream::new(client);
    assert_eq!(read_response(&mut client).await, "200 streamed");
  }

  #[tokio::test]
  async fn chunked_stream_reaches_client_while_origin_is_open() {
    let (origin, upstream) = tokio::io::duplex(4096);
    let pipes = Pipes::new(vec![upstream]);
    let config = ConfigBuilder::new().dialer(pipes).build().unwrap();
    let (mut client, server) = tokio::io::duplex(4096);
    let mut ctx = Context::new(Box::new(server), None, Arc::new(config));
    let (more_tx, more_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
      let mut origin = PeekableStream::new(origin);
      let _ = Request::read_from(&mut origin, 8192).await.unwrap();
      origin
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n6\r\ndata:1\r\n")
        .await
        .unwrap();
      let _ = more_rx.await;
      origin.write_all(b"0\r\n\r\n").await.unwrap();
    });
    let relay = tokio::spawn(async move { HttpRelay.handle(&mut ctx).await });
    client
      .write_all(b"GET /events HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();

    let mut client = PeekableStream::new(client);
    let head = tokio::time::timeout(
      Duration::from_secs(2),
      client.peek_until(b"6\r\ndata:1\r\n", 8192),
    )
    .await
    .expect("first event must arrive before the stream ends")
    .unwrap()
    .map(|bytes| String::from_utf8_lossy(bytes).to_string())
    .unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("transfer-encoding: chunked\r\n"));

    more_tx.send(()).unwrap();
    assert_eq!(relay.await.unwrap().unwrap(), Next::Close);
    assert_eq!(read_response(&mut client).await, "200 data:1");
  }

  #[tokio::test]
  async fn interim_responses_are_relayed_before_the_final_one() {
    let (origin, upstream) = tokio::io::duplex(4096);
    let pipes = Pipes::new(vec![upstream]);
    let config = ConfigBuilder::new().dialer(pipes).build().unwrap();
    let (client, server) = tokio::io::duplex(4096);
    let mut ctx = Context::new(Box::new(server), None, Arc::new(config));
    tokio::spawn(async move {
      let mut origin = PeekableStream::new(origin);
      let request = Request::read_from(&mut origin, 8192).await.unwrap().unwrap();
      assert!(request.headers().get(::http::header::EXPECT).is_none());
      assert_eq!(&request.body()[..], b"hello");
      origin
        .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 4\r\n\r\ndone")
        .await
        .unwrap();
    });
    let relay = tokio::spawn(async move { HttpRelay.handle(&mut ctx).await });

    let mut client = PeekableStream::new(client);
    client
      .write_all(b"POST /upload HTTP/1.1\r\nHost: example.com\r\nExpect: 100-continue\r\nContent-Length: 5\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();
    // the go-ahead comes before any body byte is sent
    let go_ahead = tokio::time::timeout(
      Duration::from_secs(2),
      Response::read_from(&mut client, &::http::Method::POST, 8192),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(go_ahead.status_code(), ::http::StatusCode::CONTINUE);
    client.write_all(b"hello").await.unwrap();

    let relayed = Response::read_from(&mut client, &::http::Method::POST, 8192)
      .await
      .unwrap();
    assert_eq!(relayed.status_code(), ::http::StatusCode::CONTINUE);
    let last = tokio::time::timeout(
      Duration::from_secs(2),
      Response::read_from(&mut client, &::http::Method::POST, 8192),
    )
    .await
    .expect("final response must follow the interim one")
    .unwrap();
    assert_eq!(last.status_code(), ::http::StatusCode::CREATED);
    assert_eq!(&last.body()[..], b"done");
    assert_eq!(relay.await.unwrap().unwrap(), Next::Close);
  }

  #[tokio::test]
  async fn dropped_request_closes_without_answer_or_dial() {
    let pipes = Pipes::new(Vec::new());
    let config = ConfigBuilder::new()
      .dialer(pipes.clone())
      .on_request(vec![], |_req: Request, _s: Session| async move {
        RequestOutcome::Drop
      })
      .build()
      .unwrap();
    let (mut client, server) = tokio::io::duplex(4096);
    let mut ctx = Context::new(Box::new(server), None, Arc::new(config));
    client
      .write_all(b"POST /track HTTP/1.1\r\nHost: example.com\r\nContent-Length: 2\r\n\r\nhi")
      .await
      .unwrap();
    assert_eq!(HttpRelay.handle(&mut ctx).await.unwrap(), Next::Close);
    assert_eq!(pipes.dials(), 0);
    drop(ctx);
    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();
    assert!(raw.is_empty());
  }

  #[tokio::test]
  async fn oversized_chunk_is_a_bad_request() {
    let pipes = Pipes::new(Vec::new());
    let config = ConfigBuilder::new()
      .dialer(pipes.clone())
      .max_body_size(1024)
      .on_request(vec![], |req: Request, _s: Session| async move {
        RequestOutcome::Forward(req)
      })
      .build()
      .unwrap();
    let (mut client, server) = tokio::io::duplex(4096);
    let mut ctx = Context::new(Box::new(server), None, Arc::new(config));
    client
      .write_all(b"POST / HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\n")
      .await
      .unwrap();
    let result = HttpRelay.handle(&mut ctx).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
    assert_eq!(pipes.dials(), 0);
    drop(ctx);
    let mut raw = String::new();
    client.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 400 Bad Request\r\n"));
  }

  #[tokio::test]
  async fn upgrade_goes_back_to_dispatch() {
    let config = ConfigBuilder::new().build().unwrap();
    let (mut client, server) = tokio::io::duplex(4096);
    let mut ctx = Context::new(Box::new(server), None, Arc::new(config));
    client
      .write_all(b"GET /ws HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
      .await
      .unwrap();
    assert_eq!(HttpRelay.handle(&mut ctx).await.unwrap(), Next::Dispatch);
    assert_eq!(ctx.stream.peek(3).await.unwrap(), b"GET");
  }
}
