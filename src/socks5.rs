//! SOCKS5 wire format (RFC 1928, CONNECT only)
//!
//! The server half runs the inbound handshake for [`crate::negotiator::Socks5`]; the address
//! encoding is shared with the upstream SOCKS5 client in [`crate::proxy`].

use crate::error::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Destination named in a SOCKS5 request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 or IPv6 socket address
  Ip(SocketAddr),
  /// Domain name and port
  Domain(String, u16),
}

impl TargetAddr {
  /// Host without port. IPv6 literals are not bracketed.
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ip(addr) => addr.ip().to_string(),
      TargetAddr::Domain(domain, _) => domain.clone(),
    }
  }

  /// Destination port.
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ip(addr) => addr.port(),
      TargetAddr::Domain(_, port) => *port,
    }
  }

  /// Encode a request for `cmd` towards this address.
  pub(crate) fn to_be_bytes(&self, cmd: u8) -> Result<Vec<u8>> {
    let mut packet = vec![consts::SOCKS5_VERSION, cmd, 0x00];
    match self {
      TargetAddr::Ip(SocketAddr::V4(addr)) => {
        packet.push(consts::SOCKS5_ADDR_TYPE_IPV4);
        packet.extend_from_slice(&addr.ip().octets());
      }
      TargetAddr::Ip(SocketAddr::V6(addr)) => {
        packet.push(consts::SOCKS5_ADDR_TYPE_IPV6);
        packet.extend_from_slice(&addr.ip().octets());
      }
      TargetAddr::Domain(domain, _) => {
        if domain.len() > u8::MAX as usize {
          return Err(Error::proxy_error("domain name too long"));
        }
        packet.push(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
        packet.push(domain.len() as u8);
        packet.extend_from_slice(domain.as_bytes());
      }
    }
    packet.extend_from_slice(&self.port().to_be_bytes());
    Ok(packet)
  }
}

impl fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetAddr::Ip(addr) => write!(f, "{}", addr),
      TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
    }
  }
}

/// Run the server side of a SOCKS5 CONNECT handshake and return the requested destination.
///
/// Any authentication methods the client offers are ignored and "no authentication" is selected.
/// A non-CONNECT command is answered with reply `07`, an unknown address type with `08`.
pub async fn accept<S>(stream: &mut S) -> Result<TargetAddr>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut buf = [0u8; 2];
  stream.read_exact(&mut buf).await?;
  let [version, nmethods] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::negotiation(format!(
      "unsupported SOCKS version {}",
      version
    )));
  }
  let mut methods = vec![0u8; nmethods as usize];
  stream.read_exact(&mut methods).await?;
  stream
    .write_all(&[consts::SOCKS5_VERSION, consts::SOCKS5_AUTH_METHOD_NONE])
    .await?;

  let mut buf = [0u8; 4];
  stream.read_exact(&mut buf).await?;
  let [version, cmd, _rsv, atyp] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::negotiation(format!(
      "invalid SOCKS version in request {}",
      version
    )));
  }
  if cmd != consts::SOCKS5_CMD_TCP_CONNECT {
    send_reply(stream, consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED).await?;
    return Err(Error::negotiation(format!("unsupported command {}", cmd)));
  }
  if !matches!(
    atyp,
    consts::SOCKS5_ADDR_TYPE_IPV4 | consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME | consts::SOCKS5_ADDR_TYPE_IPV6
  ) {
    send_reply(stream, consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
    return Err(Error::negotiation(format!(
      "unsupported address type {}",
      atyp
    )));
  }
  let target = read_address(stream, atyp).await?;
  send_reply(stream, consts::SOCKS5_REPLY_SUCCEEDED).await?;
  Ok(target)
}

// [VER, REP, RSV, ATYP, BND.ADDR, BND.PORT] bound to 0.0.0.0:0
async fn send_reply<S>(stream: &mut S, reply_code: u8) -> Result<()>
where
  S: AsyncWrite + Unpin,
{
  let response = [
    consts::SOCKS5_VERSION,
    reply_code,
    0x00,
    consts::SOCKS5_ADDR_TYPE_IPV4,
    0x00,
    0x00,
    0x00,
    0x00,
    0x00,
    0x00,
  ];
  stream.write_all(&response).await?;
  stream.flush().await?;
  Ok(())
}

async fn read_port<S>(stream: &mut S) -> Result<u16>
where
  S: AsyncRead + Unpin,
{
  let mut port = [0u8; 2];
  stream.read_exact(&mut port).await?;
  Ok(u16::from_be_bytes(port))
}

/// Read `DST.ADDR` and `DST.PORT` for address type `addr_type`.
pub(crate) async fn read_address<S>(stream: &mut S, addr_type: u8) -> Result<TargetAddr>
where
  S: AsyncRead + Unpin,
{
  let addr = match addr_type {
    consts::SOCKS5_ADDR_TYPE_IPV4 => {
      let mut buf = [0u8; 4];
      stream.read_exact(&mut buf).await?;
      let ip = IpAddr::V4(Ipv4Addr::from(buf));
      TargetAddr::Ip(SocketAddr::new(ip, read_port(stream).await?))
    }
    consts::SOCKS5_ADDR_TYPE_IPV6 => {
      let mut buf = [0u8; 16];
      stream.read_exact(&mut buf).await?;
      let ip = IpAddr::V6(Ipv6Addr::from(buf));
      TargetAddr::Ip(SocketAddr::new(ip, read_port(stream).await?))
    }
    consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let mut len = [0u8];
      stream.read_exact(&mut len).await?;
      let mut domain = vec![0u8; len[0] as usize];
      stream.read_exact(&mut domain).await?;
      let domain =
        String::from_utf8(domain).map_err(|_| Error::negotiation("invalid domain name"))?;
      TargetAddr::Domain(domain, read_port(stream).await?)
    }
    other => {
      return Err(Error::negotiation(format!(
        "incorrect address type {}",
        other
      )))
    }
  };
  Ok(addr)
}

#[rustfmt::skip]
pub(crate) mod consts {
  pub const SOCKS5_VERSION: u8 = 0x05;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
  pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
  pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn connect_to_domain() {
    let (mut client, mut server) = tokio::io::duplex(256);
    let mut request = vec![0x05, 0x02, 0x00, 0x02];
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 11]);
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&443u16.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let target = accept(&mut server).await.unwrap();
    assert_eq!(target, TargetAddr::Domain("example.com".to_string(), 443));

    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0, 5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
  }

  #[tokio::test]
  async fn connect_to_ipv6() {
    let (mut client, mut server) = tokio::io::duplex(256);
    let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
    request.extend_from_slice(&8080u16.to_be_bytes());
    client.write_all(&request).await.unwrap();
    let target = accept(&mut server).await.unwrap();
    assert_eq!(target.host(), "::1");
    assert_eq!(target.port(), 8080);
  }

  #[tokio::test]
  async fn bind_is_rejected() {
    let (mut client, mut server) = tokio::io::duplex(256);
    client
      .write_all(&[0x05, 0x01, 0x00, 0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
      .await
      .unwrap();
    let result = accept(&mut server).await;
    assert!(matches!(result, Err(Error::Negotiation(_))));
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[3], consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED);
  }

  #[tokio::test]
  async fn unknown_address_type_is_rejected() {
    let (mut client, mut server) = tokio::io::duplex(256);
    client
      .write_all(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x09])
      .await
      .unwrap();
    assert!(accept(&mut server).await.is_err());
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[3], consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED);
  }

  #[test]
  fn encodes_requests() {
    let v4 = TargetAddr::Ip("10.0.0.1:80".parse().unwrap());
    assert_eq!(
      v4.to_be_bytes(consts::SOCKS5_CMD_TCP_CONNECT).unwrap(),
      vec![5, 1, 0, 1, 10, 0, 0, 1, 0, 80]
    );
    let domain = TargetAddr::Domain("a.io".to_string(), 443);
    assert_eq!(
      domain.to_be_bytes(consts::SOCKS5_CMD_TCP_CONNECT).unwrap(),
      vec![5, 1, 0, 3, 4, b'a', b'.', b'i', b'o', 1, 187]
    );
    assert_eq!(domain.to_string(), "a.io:443");
  }
}
