//! Proxy configuration: the strategies, limits and hook chains every connection shares.

use crate::ca::{CertificateAuthority, CertificateIssuer};
use crate::cache::{MemoryNameCache, NameCache};
use crate::dialer::{dialer_from_url, Dialer, DirectDialer};
use crate::dispatcher::{Dispatcher, ProtocolDispatcher};
use crate::error::Result;
use crate::handler::{
  HttpHandler, HttpRelay, TcpHandler, TcpRelay, WebSocketRelay, WsHandler,
};
use crate::hook::{
  Hooks, RawGuard, RawHook, RequestGuard, RequestHook, ResponseGuard, ResponseHook, WsGuard,
  WsHook,
};
use crate::negotiator::{Negotiator, Transparent};
use crate::tls::UpstreamTls;
use std::fmt;
use std::sync::Arc;

/// Default limit on an HTTP message head.
pub const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;
/// Default limit on an HTTP body held in memory for hooks.
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Immutable proxy configuration shared by every connection.
pub struct Config {
  negotiator: Arc<dyn Negotiator>,
  dispatcher: Arc<dyn Dispatcher>,
  name_cache: Arc<dyn NameCache>,
  issuer: Arc<dyn CertificateIssuer>,
  http_handler: Arc<dyn HttpHandler>,
  ws_handler: Arc<dyn WsHandler>,
  tcp_handler: Arc<dyn TcpHandler>,
  dialer: Arc<dyn Dialer>,
  upstream_tls: UpstreamTls,
  default_san: Option<String>,
  max_connections: Option<usize>,
  max_head_size: usize,
  max_body_size: usize,
  hooks: Hooks,
}

impl fmt::Debug for Config {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Config")
      .field("default_san", &self.default_san)
      .field("max_connections", &self.max_connections)
      .field("max_head_size", &self.max_head_size)
      .field("max_body_size", &self.max_body_size)
      .field("hooks", &self.hooks)
      .finish_non_exhaustive()
  }
}

impl Config {
  /// Start building a configuration.
  pub fn builder() -> ConfigBuilder {
    ConfigBuilder::new()
  }
  /// Front handshake strategy.
  pub fn negotiator(&self) -> &Arc<dyn Negotiator> {
    &self.negotiator
  }
  /// Protocol dispatcher.
  pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
    &self.dispatcher
  }
  /// Reverse-name cache.
  pub fn name_cache(&self) -> &Arc<dyn NameCache> {
    &self.name_cache
  }
  /// Certificate issuer for TLS takeover.
  pub fn issuer(&self) -> &Arc<dyn CertificateIssuer> {
    &self.issuer
  }
  /// Handler for plain and decrypted HTTP.
  pub fn http_handler(&self) -> &Arc<dyn HttpHandler> {
    &self.http_handler
  }
  /// Handler for WebSocket upgrades.
  pub fn ws_handler(&self) -> &Arc<dyn WsHandler> {
    &self.ws_handler
  }
  /// Handler for opaque traffic.
  pub fn tcp_handler(&self) -> &Arc<dyn TcpHandler> {
    &self.tcp_handler
  }
  /// Outbound dialer.
  pub fn dialer(&self) -> &Arc<dyn Dialer> {
    &self.dialer
  }
  /// TLS policy for the origin leg.
  pub fn upstream_tls(&self) -> &UpstreamTls {
    &self.upstream_tls
  }
  /// Server name used when nothing better is known.
  pub fn default_san(&self) -> Option<&str> {
    self.default_san.as_deref()
  }
  /// Concurrent connection limit.
  pub fn max_connections(&self) -> Option<usize> {
    self.max_connections
  }
  /// Largest HTTP head accepted.
  pub fn max_head_size(&self) -> usize {
    self.max_head_size
  }
  /// Largest HTTP body buffered for hooks. Bodies no hook looks at are streamed regardless.
  pub fn max_body_size(&self) -> usize {
    self.max_body_size
  }
  /// Hook chains.
  pub fn hooks(&self) -> &Hooks {
    &self.hooks
  }
}

/// Builder for [`Config`].
///
/// Unset strategies fall back to: [`Transparent`] negotiation, [`ProtocolDispatcher`], an unbounded
/// [`MemoryNameCache`], a freshly generated [`CertificateAuthority`], the relay handlers, a
/// [`DirectDialer`] and unverified upstream TLS.
#[derive(Default)]
pub struct ConfigBuilder {
  negotiator: Option<Arc<dyn Negotiator>>,
  dispatcher: Option<Arc<dyn Dispatcher>>,
  name_cache: Option<Arc<dyn NameCache>>,
  issuer: Option<Arc<dyn CertificateIssuer>>,
  http_handler: Option<Arc<dyn HttpHandler>>,
  ws_handler: Option<Arc<dyn WsHandler>>,
  tcp_handler: Option<Arc<dyn TcpHandler>>,
  dialer: Option<Arc<dyn Dialer>>,
  upstream_proxy: Option<String>,
  upstream_tls: Option<UpstreamTls>,
  default_san: Option<String>,
  max_connections: Option<usize>,
  max_head_size: Option<usize>,
  max_body_size: Option<usize>,
  hooks: Hooks,
}

impl ConfigBuilder {
  /// Constructs a new `ConfigBuilder`.
  pub fn new() -> Self {
    Self::default()
  }
  /// Front handshake strategy.
  pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
    self.negotiator = Some(negotiator);
    self
  }
  /// Protocol dispatcher.
  pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
    self.dispatcher = Some(dispatcher);
    self
  }
  /// Reverse-name cache, for example a bounded [`MemoryNameCache`].
  pub fn name_cache(mut self, cache: Arc<dyn NameCache>) -> Self {
    self.name_cache = Some(cache);
    self
  }
  /// Certificate issuer.
  pub fn issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
    self.issuer = Some(issuer);
    self
  }
  /// HTTP handler.
  pub fn http_handler(mut self, handler: Arc<dyn HttpHandler>) -> Self {
    self.http_handler = Some(handler);
    self
  }
  /// WebSocket handler.
  pub fn ws_handler(mut self, handler: Arc<dyn WsHandler>) -> Self {
    self.ws_handler = Some(handler);
    self
  }
  /// Opaque TCP handler.
  pub fn tcp_handler(mut self, handler: Arc<dyn TcpHandler>) -> Self {
    self.tcp_handler = Some(handler);
    self
  }
  /// Outbound dialer. Takes precedence over [`ConfigBuilder::upstream_proxy`].
  pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
    self.dialer = Some(dialer);
    self
  }
  /// Chain every outbound connection through the proxy at `url`.
  pub fn upstream_proxy(mut self, url: impl Into<String>) -> Self {
    self.upstream_proxy = Some(url.into());
    self
  }
  /// TLS policy for the origin leg.
  pub fn upstream_tls(mut self, policy: UpstreamTls) -> Self {
    self.upstream_tls = Some(policy);
    self
  }
  /// Server name to issue certificates for when neither the destination nor SNI gives one.
  pub fn default_san(mut self, san: impl Into<String>) -> Self {
    self.default_san = Some(san.into());
    self
  }
  /// Limit the number of connections served at once.
  pub fn max_connections(mut self, limit: usize) -> Self {
    self.max_connections = Some(limit);
    self
  }
  /// Largest HTTP head accepted. Default is 64 KiB.
  pub fn max_head_size(mut self, size: usize) -> Self {
    self.max_head_size = Some(size);
    self
  }
  /// Largest HTTP body buffered for hooks. Default is 16 MiB.
  pub fn max_body_size(mut self, size: usize) -> Self {
    self.max_body_size = Some(size);
    self
  }
  /// Append a request hook guarded by `guards`.
  pub fn on_request<H>(mut self, guards: Vec<Arc<dyn RequestGuard>>, hook: H) -> Self
  where
    H: RequestHook + 'static,
  {
    self.hooks.on_request(guards, hook);
    self
  }
  /// Append a response hook guarded by `guards`.
  pub fn on_response<H>(mut self, guards: Vec<Arc<dyn ResponseGuard>>, hook: H) -> Self
  where
    H: ResponseHook + 'static,
  {
    self.hooks.on_response(guards, hook);
    self
  }
  /// Append a WebSocket message hook guarded by `guards`.
  pub fn on_websocket<H>(mut self, guards: Vec<Arc<dyn WsGuard>>, hook: H) -> Self
  where
    H: WsHook + 'static,
  {
    self.hooks.on_websocket(guards, hook);
    self
  }
  /// Append a raw byte hook guarded by `guards`.
  pub fn on_raw<H>(mut self, guards: Vec<Arc<dyn RawGuard>>, hook: H) -> Self
  where
    H: RawHook + 'static,
  {
    self.hooks.on_raw(guards, hook);
    self
  }

  /// Fill in defaults and freeze the configuration.
  pub fn build(self) -> Result<Config> {
    let issuer: Arc<dyn CertificateIssuer> = match self.issuer {
      Some(issuer) => issuer,
      None => Arc::new(CertificateAuthority::generate()?),
    };
    let dialer: Arc<dyn Dialer> = match (self.dialer, self.upstream_proxy) {
      (Some(dialer), _) => dialer,
      (None, Some(url)) => dialer_from_url(&url)?,
      (None, None) => Arc::new(DirectDialer::default()),
    };
    let upstream_tls = match self.upstream_tls {
      Some(policy) => policy,
      None => UpstreamTls::insecure()?,
    };
    Ok(Config {
      negotiator: self.negotiator.unwrap_or_else(|| Arc::new(Transparent)),
      dispatcher: self
        .dispatcher
        .unwrap_or_else(|| Arc::new(ProtocolDispatcher)),
      name_cache: self
        .name_cache
        .unwrap_or_else(|| Arc::new(MemoryNameCache::new())),
      issuer,
      http_handler: self.http_handler.unwrap_or_else(|| Arc::new(HttpRelay)),
      ws_handler: self.ws_handler.unwrap_or_else(|| Arc::new(WebSocketRelay)),
      tcp_handler: self.tcp_handler.unwrap_or_else(|| Arc::new(TcpRelay)),
      dialer,
      upstream_tls,
      default_san: self.default_san,
      max_connections: self.max_connections,
      max_head_size: self.max_head_size.unwrap_or(DEFAULT_MAX_HEAD_SIZE),
      max_body_size: self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
      hooks: self.hooks,
    })
  }
}
