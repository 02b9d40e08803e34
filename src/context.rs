//! Per-connection state.

use crate::config::Config;
use crate::dialer::DialOptions;
use crate::error::{Error, Result};
use crate::proxy::host_port;
use crate::stream::{BoxStream, PeekableStream};
use crate::{Request, Response};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// What the dispatcher decided the connection carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
  /// Not classified yet
  #[default]
  Unknown,
  /// HTTP/1.x requests
  Http,
  /// WebSocket after an HTTP upgrade
  WebSocket,
  /// Opaque bytes
  Tcp,
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Protocol::Unknown => "unknown",
      Protocol::Http => "http",
      Protocol::WebSocket => "websocket",
      Protocol::Tcp => "tcp",
    };
    f.write_str(label)
  }
}

/// Read-only view of a connection handed to guards and hooks.
#[derive(Debug, Clone, Default)]
pub struct Session {
  /// Random hex identifier, also recorded on the connection span
  pub id: String,
  /// Client address
  pub peer: Option<SocketAddr>,
  /// Destination host from the front handshake or the request
  pub dst_host: Option<String>,
  /// Destination port, `0` while unknown
  pub dst_port: u16,
  /// Server name the client certificate was issued for
  pub server_name: Option<String>,
  /// Whether the client leg has been decrypted
  pub tls: bool,
  /// Current classification
  pub protocol: Protocol,
}

impl Session {
  /// A fresh session with a random id.
  pub fn new(peer: Option<SocketAddr>) -> Self {
    Session {
      id: format!("{:016x}", rand::random::<u64>()),
      peer,
      ..Default::default()
    }
  }

  /// `host:port` of the destination, once known.
  pub fn destination(&self) -> Option<String> {
    let host = self.dst_host.as_deref()?;
    Some(host_port(host, self.dst_port))
  }
}

/// Everything one connection task owns.
///
/// The client stream is replaced when TLS is taken over; the upstream is dialed on first use and
/// kept for later requests on the same connection.
pub struct Context {
  /// Snapshot shared with hooks
  pub session: Session,
  /// Client leg
  pub stream: PeekableStream<BoxStream>,
  /// Origin leg, once dialed
  pub upstream: Option<PeekableStream<BoxStream>>,
  /// Request in flight
  pub request: Option<Request>,
  /// Response in flight
  pub response: Option<Response>,
  /// Server name seen in the ClientHello, when it decided the certificate
  pub sniffed_sni: Option<String>,
  config: Arc<Config>,
}

impl fmt::Debug for Context {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Context")
      .field("session", &self.session)
      .field("stream", &self.stream)
      .field("upstream", &self.upstream.is_some())
      .finish_non_exhaustive()
  }
}

impl Context {
  /// Wrap an accepted connection.
  pub fn new(stream: BoxStream, peer: Option<SocketAddr>, config: Arc<Config>) -> Self {
    Context {
      session: Session::new(peer),
      stream: PeekableStream::new(stream),
      upstream: None,
      request: None,
      response: None,
      sniffed_sni: None,
      config,
    }
  }

  /// Shared configuration.
  pub fn config(&self) -> &Arc<Config> {
    &self.config
  }

  /// Record the destination named by a front handshake or request.
  pub fn set_destination(&mut self, host: impl Into<String>, port: u16) {
    self.session.dst_host = Some(host.into());
    self.session.dst_port = port;
  }

  /// Open a fresh connection to the destination with the configured dialer.
  ///
  /// The origin leg uses TLS whenever the client leg does. The SNI is the one previously learned
  /// for the destination host, else the certificate's server name, else the host itself. The
  /// returned future owns what it needs, so the context stays free while it runs.
  pub fn dial_upstream(&self) -> impl Future<Output = Result<BoxStream>> + Send + 'static {
    let config = self.config.clone();
    let session = self.session.clone();
    async move {
      let host = session
        .dst_host
        .ok_or_else(|| Error::connection_error("destination unknown"))?;
      let port = session.dst_port;
      let opts = if session.tls {
        let sni = match config.name_cache().get_sni(&host).await {
          Some(sni) => sni,
          None => session.server_name.unwrap_or_else(|| host.clone()),
        };
        DialOptions::tls(sni).upstream_tls(config.upstream_tls().clone())
      } else {
        DialOptions::plain()
      };
      tracing::debug!("[MITM] dialing {}", host_port(&host, port));
      config.dialer().dial(&host, port, &opts).await
    }
  }

  /// The cached origin leg, dialing it first if needed.
  pub async fn upstream(&mut self) -> Result<&mut PeekableStream<BoxStream>> {
    if self.upstream.is_none() {
      let dial = self.dial_upstream();
      let stream = dial.await?;
      self.upstream = Some(PeekableStream::new(stream));
    }
    self
      .upstream
      .as_mut()
      .ok_or_else(|| Error::connection_error("upstream missing"))
  }
}
