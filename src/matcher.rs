//! Ready-made guards for the hook chains.

use crate::context::Session;
use crate::hook::{Direction, RawGuard, RequestGuard, ResponseGuard, WsGuard};
use crate::{Request, Response};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

fn lowercase_set<I, S>(items: I) -> HashSet<String>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  items
    .into_iter()
    .map(|s| s.as_ref().to_ascii_lowercase())
    .collect()
}

/// Host a request is aimed at: its URI or `Host` header, else the negotiated destination.
fn request_host(req: &Request, session: &Session) -> Option<String> {
  req
    .host()
    .or_else(|| session.dst_host.clone())
    .map(|h| h.to_ascii_lowercase())
}

/// Request host is one of `hosts`.
pub fn req_host_is<I, S>(hosts: I) -> Arc<dyn RequestGuard>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let hosts = lowercase_set(hosts);
  Arc::new(move |req: &Request, session: &Session| {
    request_host(req, session).is_some_and(|h| hosts.contains(&h))
  })
}

/// Request host falls under one of the `*.example.com` patterns.
///
/// The host is reduced with [`wildcard_fqdn`] before lookup. Patterns without `*` are ignored.
pub fn req_wildcard_is<I, S>(patterns: I) -> Arc<dyn RequestGuard>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let patterns: HashSet<String> = lowercase_set(patterns)
    .into_iter()
    .filter(|p| p.contains('*'))
    .collect();
  Arc::new(move |req: &Request, session: &Session| {
    request_host(req, session).is_some_and(|h| patterns.contains(&wildcard_fqdn(&h)))
  })
}

/// `host + path` equals one of `urls`, e.g. `example.com/login`.
pub fn req_url_is<I, S>(urls: I) -> Arc<dyn RequestGuard>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let urls: HashSet<String> = urls.into_iter().map(|u| u.as_ref().to_string()).collect();
  Arc::new(move |req: &Request, session: &Session| {
    request_host(req, session).is_some_and(|h| urls.contains(&format!("{}{}", h, req.uri().path())))
  })
}

/// Some path prefix of the request, on segment boundaries, matches one of `urls`.
///
/// `example.com/api` matches `example.com/api` and `example.com/api/v1/users` but not
/// `example.com/apix`.
pub fn req_url_like<I, S>(urls: I) -> Arc<dyn RequestGuard>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let urls: HashSet<String> = urls.into_iter().map(|u| u.as_ref().to_string()).collect();
  Arc::new(move |req: &Request, session: &Session| {
    let Some(host) = request_host(req, session) else {
      return false;
    };
    let mut prefix = host;
    for segment in req.uri().path().split('/').skip(1) {
      prefix.push('/');
      prefix.push_str(segment);
      if urls.contains(&prefix) {
        return true;
      }
    }
    false
  })
}

/// Request method is one of `methods`.
pub fn req_method_is<I, S>(methods: I) -> Arc<dyn RequestGuard>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let methods: HashSet<String> = methods
    .into_iter()
    .map(|m| m.as_ref().to_ascii_uppercase())
    .collect();
  Arc::new(move |req: &Request, _session: &Session| methods.contains(req.method().as_str()))
}

/// Request `Content-Type` equals one of `content_types`.
pub fn req_content_type_is<I, S>(content_types: I) -> Arc<dyn RequestGuard>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let content_types: HashSet<String> = content_types
    .into_iter()
    .map(|c| c.as_ref().to_string())
    .collect();
  Arc::new(move |req: &Request, _session: &Session| {
    req
      .content_type()
      .is_some_and(|c| content_types.contains(c))
  })
}

/// Negate a request guard.
pub fn not(guard: Arc<dyn RequestGuard>) -> Arc<dyn RequestGuard> {
  Arc::new(move |req: &Request, session: &Session| !guard.check(req, session))
}

/// Use a request guard on the response chain, checking the request the response answers.
pub fn on_request(guard: Arc<dyn RequestGuard>) -> Arc<dyn ResponseGuard> {
  Arc::new(move |_resp: &Response, req: &Request, session: &Session| guard.check(req, session))
}

/// Response status is one of `codes`.
pub fn status_code_is<I>(codes: I) -> Arc<dyn ResponseGuard>
where
  I: IntoIterator<Item = u16>,
{
  let codes: HashSet<u16> = codes.into_iter().collect();
  Arc::new(move |resp: &Response, _req: &Request, _session: &Session| {
    codes.contains(&resp.status_code().as_u16())
  })
}

/// WebSocket destination host is one of `hosts`.
pub fn ws_host_is<I, S>(hosts: I) -> Arc<dyn WsGuard>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let hosts = lowercase_set(hosts);
  Arc::new(move |_msg: &Message, _dir: Direction, session: &Session| {
    session
      .dst_host
      .as_ref()
      .is_some_and(|h| hosts.contains(&h.to_ascii_lowercase()))
  })
}

/// Relay destination host is one of `hosts`.
pub fn raw_host_is<I, S>(hosts: I) -> Arc<dyn RawGuard>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let hosts = lowercase_set(hosts);
  Arc::new(move |_data: &[u8], _dir: Direction, session: &Session| {
    session
      .dst_host
      .as_ref()
      .is_some_and(|h| hosts.contains(&h.to_ascii_lowercase()))
  })
}

/// Client address is one of `ips`.
pub fn remote_is<I>(ips: I) -> Arc<dyn RawGuard>
where
  I: IntoIterator<Item = IpAddr>,
{
  let ips: HashSet<IpAddr> = ips.into_iter().collect();
  Arc::new(move |_data: &[u8], _dir: Direction, session: &Session| {
    session.peer.is_some_and(|p| ips.contains(&p.ip()))
  })
}

/// Whether `host` looks like a DNS name: dot-separated labels of letters, digits and `-`, ending
/// in an alphabetic label of two or more characters. IP literals are not domains.
pub fn is_domain(host: &str) -> bool {
  let Some((labels, tld)) = host.rsplit_once('.') else {
    return false;
  };
  tld.len() >= 2
    && tld.bytes().all(|b| b.is_ascii_alphabetic())
    && labels.split('.').all(|label| {
      !label.is_empty() && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// `*.` followed by the last two labels of `fqdn`; shorter names come back unchanged.
pub fn wildcard_fqdn(fqdn: &str) -> String {
  let labels: Vec<&str> = fqdn.split('.').collect();
  if labels.len() < 2 {
    return fqdn.to_string();
  }
  format!("*.{}", labels[labels.len() - 2..].join("."))
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  fn req(method: &str, uri: &str) -> Request {
    Request::builder()
      .method(method)
      .uri(uri)
      .header("content-type", "application/json")
      .body(Bytes::new())
      .unwrap()
      .into()
  }

  #[test]
  fn host_matchers() {
    let session = Session::default();
    let r = req("GET", "http://API.Example.com/v1/users");
    assert!(req_host_is(["api.example.com"]).check(&r, &session));
    assert!(!req_host_is(["example.com"]).check(&r, &session));
    assert!(req_wildcard_is(["*.example.com"]).check(&r, &session));
    assert!(!req_wildcard_is(["example.com"]).check(&r, &session));
    assert!(not(req_host_is(["other.org"])).check(&r, &session));
  }

  #[test]
  fn host_falls_back_to_session() {
    let mut session = Session::default();
    session.dst_host = Some("intercepted.example".to_string());
    let r = req("GET", "/");
    assert!(req_host_is(["intercepted.example"]).check(&r, &session));
  }

  #[test]
  fn url_matchers() {
    let session = Session::default();
    let r = req("POST", "http://api.example.com/v1/users?x=1");
    assert!(req_url_is(["api.example.com/v1/users"]).check(&r, &session));
    assert!(req_url_like(["api.example.com/v1"]).check(&r, &session));
    assert!(!req_url_like(["api.example.com/v"]).check(&r, &session));
    assert!(req_method_is(["post"]).check(&r, &session));
    assert!(req_content_type_is(["application/json"]).check(&r, &session));
  }

  #[test]
  fn response_and_raw_matchers() {
    let mut session = Session::default();
    session.dst_host = Some("db.internal".to_string());
    session.peer = Some("10.0.0.7:50000".parse().unwrap());
    let r = req("GET", "http://a.example/");
    let resp = Response::text(http::StatusCode::NOT_FOUND, "");
    assert!(status_code_is([404, 410]).check(&resp, &r, &session));
    assert!(on_request(req_host_is(["a.example"])).check(&resp, &r, &session));
    assert!(raw_host_is(["db.internal"]).check(b"", Direction::Upstream, &session));
    assert!(remote_is(["10.0.0.7".parse().unwrap()]).check(b"", Direction::Downstream, &session));
    assert!(ws_host_is(["db.internal"]).check(
      &Message::text("hi"),
      Direction::Upstream,
      &session
    ));
  }

  #[test]
  fn domains() {
    assert!(is_domain("example.com"));
    assert!(is_domain("a-b.c.example.io"));
    assert!(!is_domain("127.0.0.1"));
    assert!(!is_domain("localhost"));
    assert!(!is_domain("bad..example.com"));
    assert_eq!(wildcard_fqdn("a.b.example.com"), "*.example.com");
    assert_eq!(wildcard_fqdn("localhost"), "localhost");
  }
}
