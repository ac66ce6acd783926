use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time;
use tracing::{info, warn};

use crate::config::Config;
use crate::route::Router;
use crate::session;

/// The accept loop and its router, wired together from one config.
pub struct Proxy {
    config: Config,
    router: Arc<Router>,
}

impl Proxy {
    pub fn new(config: Config) -> Self {
        let router = Arc::new(Router::new(config.router_options()));
        Self { config, router }
    }

    /// Control-plane access to the slot table.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        info!(addr = %self.config.listen_addr, "proxy listening");
        self.serve_on(listener).await
    }

    /// Serve an already-bound listener; used by tests to pick free ports.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        if self.config.backend_ping_period > 0 {
            let router = self.router.clone();
            let period = Duration::from_millis(self.config.backend_ping_period);
            tokio::spawn(async move {
                let mut ticker = time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if router.keep_alive().await.is_err() {
                        break;
                    }
                }
            });
        }

        loop {
            let (socket, peer) = listener.accept().await.context("accept failed")?;
            let router = self.router.clone();
            let options = self.config.session_options();
            tokio::spawn(async move {
                if let Err(err) = session::handle(socket, router, options).await {
                    warn!(%peer, error = %err, "session error");
                }
            });
        }
    }

    /// Stop routing; existing sessions drain with errors.
    pub async fn close(&self) -> Result<()> {
        self.router.close().await?;
        Ok(())
    }
}
