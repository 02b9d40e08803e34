//! Integration tests for slinger-mitm

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slinger_mitm::dialer::{DialOptions, Dialer, DirectDialer};
use slinger_mitm::negotiator::{HttpConnect, Socks5};
use slinger_mitm::{
  BoxStream, CertificateAuthority, ConfigBuilder, Direction, Message, Method, PeekableStream,
  ProxyServer, Request, RequestOutcome, Response, Session, StatusCode,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;

async fn start(server: ProxyServer) -> SocketAddr {
  let listener = server.bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move { server.serve(listener).await });
  addr
}

/// Origin answering every request on a connection with its path as the body.
async fn echo_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::spawn(async move {
        let mut stream = PeekableStream::new(stream);
        while let Ok(Some(request)) = Request::read_from(&mut stream, 8192).await {
          let path = request.uri().path().to_string();
          let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            path.len(),
            path
          );
          if stream.write_all(reply.as_bytes()).await.is_err() {
            break;
          }
        }
      });
    }
  });
  addr
}

async fn read_response<S>(stream: &mut PeekableStream<S>) -> Response
where
  S: tokio::io::AsyncRead + Unpin,
{
  Response::read_from(stream, &Method::GET, 8192)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_socks5_handshake_and_http_relay() {
  let origin = echo_origin().await;
  let config = ConfigBuilder::new()
    .negotiator(Arc::new(Socks5))
    .build()
    .unwrap();
  let proxy = start(ProxyServer::new(config)).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [0x05, 0x00]);

  let mut connect = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
  connect.extend_from_slice(&origin.port().to_be_bytes());
  client.write_all(&connect).await.unwrap();
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

  client
    .write_all(b"GET /through-socks HTTP/1.1\r\nHost: ignored.example\r\n\r\n")
    .await
    .unwrap();
  let mut client = PeekableStream::new(client);
  let response = read_response(&mut client).await;
  assert_eq!(response.status_code(), StatusCode::OK);
  assert_eq!(&response.body()[..], b"/through-socks");
}

struct CountingDialer {
  dials: AtomicUsize,
}

#[async_trait]
impl Dialer for CountingDialer {
  async fn dial(&self, host: &str, port: u16, opts: &DialOptions) -> slinger_mitm::Result<BoxStream> {
    self.dials.fetch_add(1, Ordering::SeqCst);
    DirectDialer::default().dial(host, port, opts).await
  }
}

#[tokio::test]
async fn test_request_hook_short_circuit_never_dials() {
  let dialer = Arc::new(CountingDialer {
    dials: AtomicUsize::new(0),
  });
  let config = ConfigBuilder::new()
    .dialer(dialer.clone())
    .on_request(
      vec![slinger_mitm::matcher::req_host_is(["blocked.example"])],
      |_req: Request, _session: Session| async move {
        RequestOutcome::Respond(Response::text(StatusCode::FORBIDDEN, "blocked"))
      },
    )
    .build()
    .unwrap();
  let server = ProxyServer::new(config);

  let (client, proxy_side) = tokio::io::duplex(4096);
  let task = tokio::spawn(async move { server.serve_stream(Box::new(proxy_side), None).await });
  let mut client = PeekableStream::new(client);
  client
    .write_all(b"GET /ads.js HTTP/1.1\r\nHost: blocked.example\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let response = read_response(&mut client).await;
  assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
  assert_eq!(&response.body()[..], b"blocked");
  task.await.unwrap().unwrap();
  assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_tls_takeover_reaches_request_hook() {
  let ca = Arc::new(CertificateAuthority::generate().unwrap());
  let config = ConfigBuilder::new()
    .negotiator(Arc::new(HttpConnect))
    .issuer(ca.clone())
    .on_request(Vec::new(), |req: Request, session: Session| async move {
      let body = format!(
        "{} {} tls={}",
        session.server_name.unwrap_or_default(),
        req.uri().path(),
        session.tls
      );
      RequestOutcome::Respond(Response::text(StatusCode::OK, body))
    })
    .build()
    .unwrap();
  let proxy = start(ProxyServer::new(config)).await;

  let mut tcp = TcpStream::connect(proxy).await.unwrap();
  tcp
    .write_all(b"CONNECT secure.example:443 HTTP/1.1\r\nHost: secure.example:443\r\n\r\n")
    .await
    .unwrap();
  let mut established = [0u8; 39];
  tcp.read_exact(&mut established).await.unwrap();
  assert_eq!(&established[..], b"HTTP/1.1 200 Connection established\r\n\r\n");

  let mut roots = rustls::RootCertStore::empty();
  roots.add(ca.ca_cert_der().clone()).unwrap();
  let provider = Arc::new(rustls::crypto::ring::default_provider());
  let client_config = rustls::ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
  let server_name = rustls::pki_types::ServerName::try_from("secure.example").unwrap();
  let tls = connector.connect(server_name, tcp).await.unwrap();

  let mut tls = PeekableStream::new(tls);
  tls
    .write_all(b"GET /account HTTP/1.1\r\nHost: secure.example\r\n\r\n")
    .await
    .unwrap();
  let response = read_response(&mut tls).await;
  assert_eq!(response.status_code(), StatusCode::OK);
  assert_eq!(&response.body()[..], b"secure.example /account tls=true");
}

#[tokio::test]
async fn test_keep_alive_relay_with_response_hook() {
  let origin = echo_origin().await;
  let config = ConfigBuilder::new()
    .on_response(
      vec![slinger_mitm::matcher::status_code_is([200])],
      |mut resp: Response, _req: Request, _session: Session| async move {
        resp
          .headers_mut()
          .insert("x-intercepted", http::HeaderValue::from_static("1"));
        resp
      },
    )
    .build()
    .unwrap();
  let proxy = start(ProxyServer::new(config)).await;

  let mut client = PeekableStream::new(TcpStream::connect(proxy).await.unwrap());
  for path in ["/first", "/second"] {
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, origin);
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(&response.body()[..], path.as_bytes());
    assert_eq!(
      response.headers().get("x-intercepted").unwrap(),
      "1"
    );
  }
}

#[tokio::test]
async fn test_websocket_frames_pass_through_hooks() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (stream, _) = origin.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    while let Some(Ok(msg)) = ws.next().await {
      if msg.is_close() {
        break;
      }
      ws.send(msg).await.unwrap();
    }
  });

  let seen = Arc::new(AtomicUsize::new(0));
  let counter = seen.clone();
  let config = ConfigBuilder::new()
    .on_websocket(
      Vec::new(),
      move |msg: Message, direction: Direction, _session: Session| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
          match (direction, msg) {
            (Direction::Downstream, Message::Text(text)) => {
              Message::text(format!("[{}]", text.as_str()))
            }
            (_, msg) => msg,
          }
        }
      },
    )
    .build()
    .unwrap();
  let proxy = start(ProxyServer::new(config)).await;

  let tcp = TcpStream::connect(proxy).await.unwrap();
  let url = format!("ws://{}/socket", origin_addr);
  let (mut ws, response) = tokio_tungstenite::client_async(url, tcp).await.unwrap();
  assert_eq!(response.status(), 101);
  ws.send(Message::text("hi")).await.unwrap();
  let reply = ws.next().await.unwrap().unwrap();
  assert_eq!(reply, Message::text("[hi]"));
  assert_eq!(seen.load(Ordering::SeqCst), 2);
  ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_opaque_relay_ends_when_origin_closes() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).await.unwrap();
    stream.write_all(&buf).await.unwrap();
    // dropping the stream closes the origin leg
  });

  let raw_chunks = Arc::new(AtomicUsize::new(0));
  let counter = raw_chunks.clone();
  let config = ConfigBuilder::new()
    .negotiator(Arc::new(Socks5))
    .on_raw(
      Vec::new(),
      move |data: Bytes, _direction: Direction, _session: Session| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { data }
      },
    )
    .build()
    .unwrap();
  let proxy = start(ProxyServer::new(config)).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let mut handshake = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
  handshake.extend_from_slice(&origin_addr.port().to_be_bytes());
  client.write_all(&handshake).await.unwrap();
  let mut replies = [0u8; 12];
  client.read_exact(&mut replies).await.unwrap();

  client.write_all(b"\x00\x01\x02bin").await.unwrap();
  // the client never closes its side; the relay must still end once the origin is gone
  let mut echoed = Vec::new();
  tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut echoed))
    .await
    .expect("relay did not finish")
    .unwrap();
  assert_eq!(echoed, b"\x00\x01\x02bin");
  assert!(raw_chunks.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_connection_limit_queues_extra_clients() {
  let config = ConfigBuilder::new()
    .max_connections(1)
    .on_request(Vec::new(), |_req: Request, _session: Session| async move {
      RequestOutcome::Respond(Response::text(StatusCode::OK, "ok"))
    })
    .build()
    .unwrap();
  let proxy = start(ProxyServer::new(config)).await;

  // holds the only slot without sending anything
  let first = TcpStream::connect(proxy).await.unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;

  let mut second = PeekableStream::new(TcpStream::connect(proxy).await.unwrap());
  second
    .write_all(b"GET / HTTP/1.1\r\nHost: limited.example\r\n\r\n")
    .await
    .unwrap();
  let waiting = tokio::time::timeout(Duration::from_millis(200), second.peek(1)).await;
  assert!(waiting.is_err(), "second client served while the slot was taken");

  drop(first);
  let response = tokio::time::timeout(Duration::from_secs(5), read_response(&mut second))
    .await
    .expect("second client was never served");
  assert_eq!(&response.body()[..], b"ok");
}
