//! Reverse-name cache.
//!
//! Transparent and SOCKS-by-IP connections only know the destination IP. Once a TLS ClientHello
//! has revealed the hostname behind an IP, later connections to the same IP reuse it without
//! sniffing again.

use async_trait::async_trait;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent IP→domain and domain→SNI lookups.
#[async_trait]
pub trait NameCache: Send + Sync {
  /// Domain previously learned for an IP literal.
  async fn get_ptr(&self, ip: &str) -> Option<String>;
  /// Remember the domain behind an IP literal.
  async fn set_ptr(&self, ip: &str, domain: &str);
  /// SNI the client used when talking to `domain`.
  async fn get_sni(&self, domain: &str) -> Option<String>;
  /// Remember the SNI negotiated for `domain`.
  async fn set_sni(&self, domain: &str, sni: &str);
}

/// In-memory [`NameCache`] backed by moka, with hit and miss counters.
pub struct MemoryNameCache {
  ptr: Cache<String, String>,
  sni: Cache<String, String>,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl Default for MemoryNameCache {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryNameCache {
  /// Unbounded cache.
  pub fn new() -> Self {
    Self::from_caches(Cache::builder().build(), Cache::builder().build())
  }

  /// Cache holding at most `capacity` entries per table.
  pub fn with_capacity(capacity: u64) -> Self {
    Self::from_caches(
      Cache::builder().max_capacity(capacity).build(),
      Cache::builder().max_capacity(capacity).build(),
    )
  }

  fn from_caches(ptr: Cache<String, String>, sni: Cache<String, String>) -> Self {
    MemoryNameCache {
      ptr,
      sni,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }

  /// Lookups that found an entry.
  pub fn hits(&self) -> u64 {
    self.hits.load(Ordering::Relaxed)
  }

  /// Lookups that found nothing.
  pub fn misses(&self) -> u64 {
    self.misses.load(Ordering::Relaxed)
  }

  fn record<T>(&self, found: Option<T>) -> Option<T> {
    let counter = if found.is_some() {
      &self.hits
    } else {
      &self.misses
    };
    counter.fetch_add(1, Ordering::Relaxed);
    found
  }
}

#[async_trait]
impl NameCache for MemoryNameCache {
  async fn get_ptr(&self, ip: &str) -> Option<String> {
    let found = self.ptr.get(ip).await;
    self.record(found)
  }

  async fn set_ptr(&self, ip: &str, domain: &str) {
    self.ptr.insert(ip.to_string(), domain.to_string()).await;
  }

  async fn get_sni(&self, domain: &str) -> Option<String> {
    let found = self.sni.get(domain).await;
    self.record(found)
  }

  async fn set_sni(&self, domain: &str, sni: &str) {
    self.sni.insert(domain.to_string(), sni.to_string()).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn last_write_wins_and_counts() {
    let cache = MemoryNameCache::new();
    assert_eq!(cache.get_ptr("1.2.3.4").await, None);
    cache.set_ptr("1.2.3.4", "a.example.com").await;
    cache.set_ptr("1.2.3.4", "b.example.com").await;
    assert_eq!(
      cache.get_ptr("1.2.3.4").await.as_deref(),
      Some("b.example.com")
    );
    cache.set_sni("b.example.com", "b.example.com").await;
    assert!(cache.get_sni("b.example.com").await.is_some());
    assert_eq!(cache.hits(), 2);
    assert_eq!(cache.misses(), 1);
  }
}
