//! Admission control for the accept loop.

use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of connections served at once.
///
/// A permit is taken before each `accept` and travels with the connection task, so capacity comes
/// back when the task ends.
#[derive(Debug, Clone)]
pub struct Limiter {
  semaphore: Arc<Semaphore>,
}

impl Limiter {
  /// Allow up to `limit` concurrent connections.
  pub fn new(limit: usize) -> Self {
    Limiter {
      semaphore: Arc::new(Semaphore::new(limit)),
    }
  }

  /// Wait until a connection slot is free.
  pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
    self
      .semaphore
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| Error::other("connection limiter closed"))
  }

  /// Slots currently free.
  pub fn available(&self) -> usize {
    self.semaphore.available_permits()
  }
}
