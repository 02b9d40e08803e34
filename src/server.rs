//! Listener loop.

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::limiter::Limiter;
use crate::stream::BoxStream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::Instrument;

/// Proxy server: accepts connections and runs each through negotiation and dispatch on its own
/// task.
#[derive(Debug, Clone)]
pub struct ProxyServer {
  config: Arc<Config>,
  limiter: Option<Limiter>,
}

impl ProxyServer {
  /// Serve with `config`. A connection limit in the config turns on admission control.
  pub fn new(config: Config) -> Self {
    let limiter = config.max_connections().map(Limiter::new);
    ProxyServer {
      config: Arc::new(config),
      limiter,
    }
  }

  /// Shared configuration.
  pub fn config(&self) -> &Arc<Config> {
    &self.config
  }

  /// Bind a listening socket.
  pub async fn bind<A: ToSocketAddrs>(&self, addr: A) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::proxy_error(format!("Failed to bind: {}", e)))?;
    if let Ok(local) = listener.local_addr() {
      tracing::info!("[MITM] listening on {}", local);
    }
    Ok(listener)
  }

  /// Bind `addr` and serve until the process ends.
  pub async fn run<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
    let listener = self.bind(addr).await?;
    self.serve(listener).await
  }

  /// Accept connections from `listener` forever.
  ///
  /// Only a closed limiter ends the loop; accept errors are logged and retried.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      let permit = match &self.limiter {
        Some(limiter) => Some(limiter.acquire().await?),
        None => None,
      };
      let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          tracing::error!("[MITM] Failed to accept connection: {}", e);
          tokio::time::sleep(Duration::from_millis(100)).await;
          continue;
        }
      };
      if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("[MITM] set_nodelay for {} failed: {}", peer, e);
      }
      let ctx = Context::new(Box::new(stream), Some(peer), self.config.clone());
      let span = tracing::info_span!("connection", id = %ctx.session.id, peer = %peer);
      tokio::spawn(
        async move {
          tracing::info!("[MITM] accepted");
          report(drive(ctx).await);
          drop(permit);
        }
        .instrument(span),
      );
    }
  }

  /// Serve one already-accepted stream on the current task.
  pub async fn serve_stream(&self, stream: BoxStream, peer: Option<SocketAddr>) -> Result<()> {
    drive(Context::new(stream, peer, self.config.clone())).await
  }
}

async fn drive(mut ctx: Context) -> Result<()> {
  let config = ctx.config().clone();
  config.negotiator().handshake(&mut ctx).await?;
  config.dispatcher().dispatch(ctx).await
}

fn report(result: Result<()>) {
  match result {
    Ok(()) => tracing::debug!("[MITM] connection closed"),
    Err(e) if e.is_benign() => tracing::debug!("[MITM] connection closed by peer: {}", e),
    Err(e) => tracing::error!("[MITM] Error handling connection: {}", e),
  }
}
