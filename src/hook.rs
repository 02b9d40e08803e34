//! Interception points.
//!
//! Four ordered chains, one per traffic kind. Each entry pairs guards with a transform; the
//! transform runs only when every guard accepts, and an empty chain leaves traffic untouched.
//! Guards and transforms are traits with blanket impls for closures, so both
//!
//! ```rust
//! use slinger_mitm::hook::{Hooks, RequestOutcome};
//! use slinger_mitm::{matcher, Request, Response, Session};
//!
//! let mut hooks = Hooks::default();
//! hooks.on_request(
//!   vec![matcher::req_host_is(["blocked.example"])],
//!   |_req: Request, _session: Session| async move {
//!     RequestOutcome::Respond(Response::text(http::StatusCode::FORBIDDEN, "blocked"))
//!   },
//! );
//! ```
//!
//! and hand-written types work.

use crate::context::Session;
use crate::{Request, Response};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

/// Which way traffic is flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
  /// Client to origin
  Upstream,
  /// Origin to client
  Downstream,
}

/// What a request hook decided.
#[derive(Debug)]
pub enum RequestOutcome {
  /// Continue down the chain and on to the origin with this request
  Forward(Request),
  /// Answer the client directly; the origin is never contacted
  Respond(Response),
  /// Close the connection without answering
  Drop,
}

/// Predicate over a request.
pub trait RequestGuard: Send + Sync {
  /// Whether the guarded transform applies.
  fn check(&self, req: &Request, session: &Session) -> bool;
}

impl<F> RequestGuard for F
where
  F: Fn(&Request, &Session) -> bool + Send + Sync,
{
  fn check(&self, req: &Request, session: &Session) -> bool {
    self(req, session)
  }
}

/// Predicate over a response and the request it answers.
pub trait ResponseGuard: Send + Sync {
  /// Whether the guarded transform applies.
  fn check(&self, resp: &Response, req: &Request, session: &Session) -> bool;
}

impl<F> ResponseGuard for F
where
  F: Fn(&Response, &Request, &Session) -> bool + Send + Sync,
{
  fn check(&self, resp: &Response, req: &Request, session: &Session) -> bool {
    self(resp, req, session)
  }
}

/// Predicate over a WebSocket message.
pub trait WsGuard: Send + Sync {
  /// Whether the guarded transform applies.
  fn check(&self, msg: &Message, direction: Direction, session: &Session) -> bool;
}

impl<F> WsGuard for F
where
  F: Fn(&Message, Direction, &Session) -> bool + Send + Sync,
{
  fn check(&self, msg: &Message, direction: Direction, session: &Session) -> bool {
    self(msg, direction, session)
  }
}

/// Predicate over relayed bytes.
pub trait RawGuard: Send + Sync {
  /// Whether the guarded transform applies.
  fn check(&self, data: &[u8], direction: Direction, session: &Session) -> bool;
}

impl<F> RawGuard for F
where
  F: Fn(&[u8], Direction, &Session) -> bool + Send + Sync,
{
  fn check(&self, data: &[u8], direction: Direction, session: &Session) -> bool {
    self(data, direction, session)
  }
}

/// Transform for requests.
#[async_trait]
pub trait RequestHook: Send + Sync {
  /// Rewrite, answer or drop `req`.
  async fn handle(&self, req: Request, session: &Session) -> RequestOutcome;
}

#[async_trait]
impl<F, Fut> RequestHook for F
where
  F: Fn(Request, Session) -> Fut + Send + Sync,
  Fut: Future<Output = RequestOutcome> + Send + 'static,
{
  async fn handle(&self, req: Request, session: &Session) -> RequestOutcome {
    self(req, session.clone()).await
  }
}

/// Transform for responses.
#[async_trait]
pub trait ResponseHook: Send + Sync {
  /// Rewrite `resp`, which answers `req`.
  async fn handle(&self, resp: Response, req: &Request, session: &Session) -> Response;
}

#[async_trait]
impl<F, Fut> ResponseHook for F
where
  F: Fn(Response, Request, Session) -> Fut + Send + Sync,
  Fut: Future<Output = Response> + Send + 'static,
{
  async fn handle(&self, resp: Response, req: &Request, session: &Session) -> Response {
    self(resp, req.clone(), session.clone()).await
  }
}

/// Transform for WebSocket messages.
#[async_trait]
pub trait WsHook: Send + Sync {
  /// Rewrite one message travelling in `direction`.
  async fn handle(&self, msg: Message, direction: Direction, session: &Session) -> Message;
}

#[async_trait]
impl<F, Fut> WsHook for F
where
  F: Fn(Message, Direction, Session) -> Fut + Send + Sync,
  Fut: Future<Output = Message> + Send + 'static,
{
  async fn handle(&self, msg: Message, direction: Direction, session: &Session) -> Message {
    self(msg, direction, session.clone()).await
  }
}

/// Transform for relayed bytes.
#[async_trait]
pub trait RawHook: Send + Sync {
  /// Rewrite one chunk travelling in `direction`.
  async fn handle(&self, data: Bytes, direction: Direction, session: &Session) -> Bytes;
}

#[async_trait]
impl<F, Fut> RawHook for F
where
  F: Fn(Bytes, Direction, Session) -> Fut + Send + Sync,
  Fut: Future<Output = Bytes> + Send + 'static,
{
  async fn handle(&self, data: Bytes, direction: Direction, session: &Session) -> Bytes {
    self(data, direction, session.clone()).await
  }
}

struct Entry<G: ?Sized, H: ?Sized> {
  guards: Vec<Arc<G>>,
  hook: Arc<H>,
}

impl<G: ?Sized, H: ?Sized> Clone for Entry<G, H> {
  fn clone(&self) -> Self {
    Entry {
      guards: self.guards.clone(),
      hook: self.hook.clone(),
    }
  }
}

/// The four hook chains.
#[derive(Clone, Default)]
pub struct Hooks {
  request: Vec<Entry<dyn RequestGuard, dyn RequestHook>>,
  response: Vec<Entry<dyn ResponseGuard, dyn ResponseHook>>,
  websocket: Vec<Entry<dyn WsGuard, dyn WsHook>>,
  raw: Vec<Entry<dyn RawGuard, dyn RawHook>>,
}

impl std::fmt::Debug for Hooks {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Hooks")
      .field("request", &self.request.len())
      .field("response", &self.response.len())
      .field("websocket", &self.websocket.len())
      .field("raw", &self.raw.len())
      .finish()
  }
}

impl Hooks {
  /// Append a request transform.
  pub fn on_request<H>(&mut self, guards: Vec<Arc<dyn RequestGuard>>, hook: H)
  where
    H: RequestHook + 'static,
  {
    self.request.push(Entry {
      guards,
      hook: Arc::new(hook),
    });
  }

  /// Append a response transform.
  pub fn on_response<H>(&mut self, guards: Vec<Arc<dyn ResponseGuard>>, hook: H)
  where
    H: ResponseHook + 'static,
  {
    self.response.push(Entry {
      guards,
      hook: Arc::new(hook),
    });
  }

  /// Append a WebSocket message transform.
  pub fn on_websocket<H>(&mut self, guards: Vec<Arc<dyn WsGuard>>, hook: H)
  where
    H: WsHook + 'static,
  {
    self.websocket.push(Entry {
      guards,
      hook: Arc::new(hook),
    });
  }

  /// Append a raw byte transform.
  pub fn on_raw<H>(&mut self, guards: Vec<Arc<dyn RawGuard>>, hook: H)
  where
    H: RawHook + 'static,
  {
    self.raw.push(Entry {
      guards,
      hook: Arc::new(hook),
    });
  }

  /// Whether any raw transform is registered.
  pub fn has_raw(&self) -> bool {
    !self.raw.is_empty()
  }

  /// Whether a request transform applies to `req`, judged on its head alone.
  ///
  /// Bodies are held in memory only for messages some transform will see; everything else is
  /// streamed through.
  pub fn intercepts_request(&self, req: &Request, session: &Session) -> bool {
    self
      .request
      .iter()
      .any(|entry| entry.guards.iter().all(|g| g.check(req, session)))
  }

  /// Whether a response transform applies to `resp`, judged on its head alone.
  pub fn intercepts_response(&self, resp: &Response, req: &Request, session: &Session) -> bool {
    self
      .response
      .iter()
      .any(|entry| entry.guards.iter().all(|g| g.check(resp, req, session)))
  }

  /// Run the request chain. `Respond` and `Drop` stop it early.
  pub async fn run_request(&self, mut req: Request, session: &Session) -> RequestOutcome {
    for entry in &self.request {
      if !entry.guards.iter().all(|g| g.check(&req, session)) {
        continue;
      }
      match entry.hook.handle(req, session).await {
        RequestOutcome::Forward(next) => req = next,
        outcome => return outcome,
      }
    }
    RequestOutcome::Forward(req)
  }

  /// Run the response chain.
  pub async fn run_response(&self, mut resp: Response, req: &Request, session: &Session) -> Response {
    for entry in &self.response {
      if entry.guards.iter().all(|g| g.check(&resp, req, session)) {
        resp = entry.hook.handle(resp, req, session).await;
      }
    }
    resp
  }

  /// Run the WebSocket chain over one message.
  pub async fn run_websocket(
    &self,
    mut msg: Message,
    direction: Direction,
    session: &Session,
  ) -> Message {
    for entry in &self.websocket {
      if entry.guards.iter().all(|g| g.check(&msg, direction, session)) {
        msg = entry.hook.handle(msg, direction, session).await;
      }
    }
    msg
  }

  /// Run the raw chain over one chunk.
  pub async fn run_raw(&self, mut data: Bytes, direction: Direction, session: &Session) -> Bytes {
    for entry in &self.raw {
      if entry.guards.iter().all(|g| g.check(&data, direction, session)) {
        data = entry.hook.handle(data, direction, session).await;
      }
    }
    data
  }
}
