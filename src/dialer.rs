//! Outbound connections towards the origin, direct or through an upstream proxy.

use crate::error::{new_io_error, Error, Result};
use crate::proxy::Proxy;
use crate::stream::{BoxStream, PeekableStream};
use crate::tls::UpstreamTls;
use async_trait::async_trait;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// Per-dial settings chosen by the handler.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
  server_name: Option<String>,
  upstream_tls: Option<UpstreamTls>,
}

impl DialOptions {
  /// Plain TCP.
  pub fn plain() -> Self {
    Self::default()
  }

  /// Wrap the connection in TLS, sending `server_name` as SNI.
  pub fn tls(server_name: impl Into<String>) -> Self {
    DialOptions {
      server_name: Some(server_name.into()),
      upstream_tls: None,
    }
  }

  /// TLS policy for the handshake. Without one, certificates are not verified.
  pub fn upstream_tls(mut self, policy: UpstreamTls) -> Self {
    self.upstream_tls = Some(policy);
    self
  }

  /// SNI to present upstream, when TLS was requested.
  pub fn server_name(&self) -> Option<&str> {
    self.server_name.as_deref()
  }

  /// Apply the TLS layer, if any, to an established connection.
  pub(crate) async fn finish(&self, stream: BoxStream) -> Result<BoxStream> {
    let Some(server_name) = &self.server_name else {
      return Ok(stream);
    };
    let tls = match &self.upstream_tls {
      Some(tls) => tls.clone(),
      None => UpstreamTls::insecure()?,
    };
    Ok(Box::new(tls.connect(stream, server_name).await?))
  }
}

/// Opens connections to `host:port`.
#[async_trait]
pub trait Dialer: Send + Sync {
  /// Connect, tunnelling and wrapping in TLS as `opts` ask. A failed dial closes whatever part of
  /// the connection was already established.
  async fn dial(&self, host: &str, port: u16, opts: &DialOptions) -> Result<BoxStream>;
}

/// Connects straight to the destination.
#[derive(Debug, Clone)]
pub struct DirectDialer {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
}

impl Default for DirectDialer {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
    }
  }
}

impl DirectDialer {
  /// Dialer with a 10 second connect timeout and `TCP_NODELAY`.
  pub fn new() -> Self {
    Self::default()
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.connect_timeout = timeout;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> Self {
    self.nodelay = value;
    self
  }
  /// Set that all sockets have `SO_KEEPALIVE` set to the supplied value.
  pub fn keepalive(mut self, value: bool) -> Self {
    self.keepalive = value;
    self
  }

  /// Resolve `host` and connect to the first address that accepts.
  pub(crate) async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last_error = Some(e),
      }
    }
    Err(last_error.unwrap_or_else(|| Error::connection_error(format!("no address for {}", host))))
  }

  async fn connect_with_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(stream)
  }
}

#[async_trait]
impl Dialer for DirectDialer {
  async fn dial(&self, host: &str, port: u16, opts: &DialOptions) -> Result<BoxStream> {
    let stream = self.connect(host, port).await?;
    opts.finish(Box::new(stream)).await
  }
}

/// Tunnels every connection through an upstream proxy.
#[derive(Debug, Clone)]
pub struct ProxyDialer {
  proxy: Proxy,
  direct: DirectDialer,
  proxy_tls: Option<UpstreamTls>,
}

impl ProxyDialer {
  /// Dialer for `proxy`, reaching the proxy itself with default socket options.
  pub fn new(proxy: Proxy) -> Self {
    ProxyDialer {
      proxy,
      direct: DirectDialer::default(),
      proxy_tls: None,
    }
  }
  /// Socket options for the hop to the proxy.
  pub fn direct(mut self, direct: DirectDialer) -> Self {
    self.direct = direct;
    self
  }
  /// TLS policy for an `https://` proxy. Without one, its certificate is not verified.
  pub fn proxy_tls(mut self, policy: UpstreamTls) -> Self {
    self.proxy_tls = Some(policy);
    self
  }
  /// The proxy connections go through.
  pub fn proxy(&self) -> &Proxy {
    &self.proxy
  }
}

#[async_trait]
impl Dialer for ProxyDialer {
  async fn dial(&self, host: &str, port: u16, opts: &DialOptions) -> Result<BoxStream> {
    let (proxy_host, proxy_port) = self.proxy.endpoint();
    let tcp = self.direct.connect(proxy_host, proxy_port).await?;
    let mut hop: BoxStream = Box::new(tcp);
    if self.proxy.is_https() {
      let tls = match &self.proxy_tls {
        Some(tls) => tls.clone(),
        None => UpstreamTls::insecure()?,
      };
      hop = Box::new(tls.connect(hop, proxy_host).await?);
    }
    // bytes the proxy sends right after its reply stay in the buffer
    let mut stream = PeekableStream::new(hop);
    if let Err(e) = self.proxy.tunnel(&mut stream, host, port).await {
      tracing::debug!("[MITM] tunnel via {} failed: {}", self.proxy.uri(), e);
      return Err(e);
    }
    opts.finish(Box::new(stream)).await
  }
}

/// Build the dialer for an upstream proxy URL (`http`, `https`, `socks5`, `socks5h`).
pub fn dialer_from_url(url: &str) -> Result<Arc<dyn Dialer>> {
  let proxy = Proxy::parse(url)?;
  Ok(Arc::new(ProxyDialer::new(proxy)))
}
