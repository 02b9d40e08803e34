//! TLS configuration for the upstream leg
//!
use crate::error::{Error, Result};
use crate::stream::AsyncIo;
use std::sync::Arc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// The installed process-wide crypto provider, or ring.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client-side TLS policy for connections towards the origin.
///
/// By default upstream certificates are accepted without verification.
#[derive(Clone)]
pub struct UpstreamTls {
  connector: TlsConnector,
}

impl std::fmt::Debug for UpstreamTls {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UpstreamTls").finish_non_exhaustive()
  }
}

impl UpstreamTls {
  /// Accept any upstream certificate.
  pub fn insecure() -> Result<Self> {
    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
      .with_protocol_versions(rustls::ALL_VERSIONS)?
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth();
    Ok(Self::from_config(config))
  }

  /// Verify upstream certificates against `roots`.
  pub fn verified(roots: RootCertStore) -> Result<Self> {
    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
      .with_protocol_versions(rustls::ALL_VERSIONS)?
      .with_root_certificates(roots)
      .with_no_client_auth();
    Ok(Self::from_config(config))
  }

  /// Wrap a caller supplied client configuration. ALPN is pinned to `http/1.1`.
  pub fn from_config(mut config: rustls::ClientConfig) -> Self {
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    UpstreamTls {
      connector: TlsConnector::from(Arc::new(config)),
    }
  }

  /// Run the client handshake over `stream`.
  ///
  /// On failure the stream is dropped, which closes the connection.
  pub async fn connect<S>(&self, stream: S, server_name: &str) -> Result<TlsStream<S>>
  where
    S: AsyncIo,
  {
    let domain = ServerName::try_from(server_name.to_string())
      .map_err(|e| Error::tls_error(format!("invalid server name {server_name}: {e}")))?;
    self
      .connector
      .connect(domain, stream)
      .await
      .map_err(|e| Error::tls_error(format!("handshake with {server_name} failed: {e}")))
  }
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    crypto_provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}
