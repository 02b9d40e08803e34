//! Certificate issuance for TLS takeover.
//!
//! A [`CertificateIssuer`] hands the dispatcher a rustls [`ServerConfig`] for whatever server name
//! the client asked for. Three strategies ship with the crate:
//!
//! - [`CertificateAuthority`]: leaf certificates signed on the fly by a root CA the client trusts
//! - [`SelfSigned`]: a throwaway self-signed certificate per name
//! - [`StaticCertificate`]: one fixed chain for every name
//!

use crate::error::{Error, Result};
use crate::tls::crypto_provider;
use async_trait::async_trait;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::ServerConfig;

/// Certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live in seconds (6 months)
const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Validity of throwaway self-signed certificates
const SELF_SIGNED_DAYS: i64 = 3;
/// Server configs kept per issuer
const CACHE_CAPACITY: u64 = 1000;

/// Produces the TLS server side of an intercepted connection.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
  /// Server configuration presenting a certificate valid for `server_name`.
  async fn server_config(&self, server_name: &str) -> Result<Arc<ServerConfig>>;
}

/// Build a server config offering HTTP/1.1 over ALPN.
pub(crate) fn build_server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| Error::tls_error(format!("Invalid server certificate: {}", e)))?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

fn subject_alt_names(domain: &str) -> Result<Vec<SanType>> {
  // IP targets get both an iPAddress and a dNSName entry; clients differ in which one they check.
  if let Ok(ip) = domain.parse::<IpAddr>() {
    let mut sans = vec![SanType::IpAddress(ip)];
    if let Ok(dns_name) = domain.try_into() {
      sans.push(SanType::DnsName(dns_name));
    }
    return Ok(sans);
  }
  let dns_name = domain
    .try_into()
    .map_err(|_| Error::certificate_error(format!("Invalid domain name: {}", domain)))?;
  Ok(vec![SanType::DnsName(dns_name)])
}

fn key_der(key_pair: &KeyPair) -> Result<PrivateKeyDer<'static>> {
  PrivateKeyDer::try_from(key_pair.serialize_der())
    .map_err(|_| Error::certificate_error("Failed to serialize private key"))
}

/// Certificate Authority signing a leaf certificate per server name.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  cache: Cache<String, Arc<ServerConfig>>,
}

impl CertificateAuthority {
  /// Generate a fresh in-memory root CA.
  ///
  /// Export it with [`CertificateAuthority::ca_cert_pem`] and install it on the client so the
  /// issued leaves are trusted.
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Slinger MITM Proxy CA");
    dn.push(DnType::OrganizationName, "Emo-Crab");
    dn.push(DnType::CountryName, "CN");
    dn.push(DnType::LocalityName, "Internet");
    dn.push(DnType::StateOrProvinceName, "World");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    // 10 years
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;
    Self::from_parts(cert.pem(), key_pair)
  }

  /// Load a root CA from PEM encoded certificate and private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;
    Self::from_parts(cert_pem.to_string(), key_pair)
  }

  fn from_parts(cert_pem: String, key_pair: KeyPair) -> Result<Self> {
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;
    let cache = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem,
      cache,
    })
  }

  /// Generate a server certificate signed by this CA
  ///
  /// Returns the chain `[leaf, ca]` and the leaf key.
  pub fn generate_server_cert(
    &self,
    domain: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names(domain)?;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign server cert: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der(&key_pair)?))
  }

  /// Get CA certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Get CA certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}

#[async_trait]
impl CertificateIssuer for CertificateAuthority {
  async fn server_config(&self, server_name: &str) -> Result<Arc<ServerConfig>> {
    if let Some(config) = self.cache.get(server_name).await {
      return Ok(config);
    }
    let (chain, key) = self.generate_server_cert(server_name)?;
    let config = build_server_config(chain, key)?;
    self
      .cache
      .insert(server_name.to_string(), config.clone())
      .await;
    Ok(config)
  }
}

/// Self-signed certificate per server name, valid for three days.
pub struct SelfSigned {
  cache: Cache<String, Arc<ServerConfig>>,
}

impl Default for SelfSigned {
  fn default() -> Self {
    Self::new()
  }
}

impl SelfSigned {
  /// New issuer with an empty cache.
  pub fn new() -> Self {
    SelfSigned {
      cache: Cache::builder()
        .max_capacity(CACHE_CAPACITY)
        .time_to_live(std::time::Duration::from_secs(
          (SELF_SIGNED_DAYS * 24 * 60 * 60 / 2) as u64,
        ))
        .build(),
    }
  }

  fn generate(server_name: &str) -> Result<Arc<ServerConfig>> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, server_name);
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names(server_name)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(SELF_SIGNED_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to self-sign: {}", e)))?;
    build_server_config(
      vec![CertificateDer::from(cert.der().to_vec())],
      key_der(&key_pair)?,
    )
  }
}

#[async_trait]
impl CertificateIssuer for SelfSigned {
  async fn server_config(&self, server_name: &str) -> Result<Arc<ServerConfig>> {
    if let Some(config) = self.cache.get(server_name).await {
      return Ok(config);
    }
    let config = Self::generate(server_name)?;
    self
      .cache
      .insert(server_name.to_string(), config.clone())
      .await;
    Ok(config)
  }
}

/// The same certificate chain for every server name.
pub struct StaticCertificate {
  config: Arc<ServerConfig>,
}

impl StaticCertificate {
  /// From a DER chain (leaf first) and its private key.
  pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
    Ok(StaticCertificate {
      config: build_server_config(chain, key)?,
    })
  }

  /// From PEM encoded chain and private key.
  pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
    let chain = rustls_pemfile::certs(&mut &chain_pem[..])
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM chain: {}", e)))?;
    if chain.is_empty() {
      return Err(Error::certificate_error("No certificate found in PEM"));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM key: {}", e)))?
      .ok_or_else(|| Error::certificate_error("No private key found in PEM"))?;
    Self::new(chain, key)
  }
}

#[async_trait]
impl CertificateIssuer for StaticCertificate {
  async fn server_config(&self, _server_name: &str) -> Result<Arc<ServerConfig>> {
    Ok(self.config.clone())
  }
}
