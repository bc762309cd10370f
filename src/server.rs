use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{Config, EngineKind};
use crate::error::GatekeeperError;
use crate::limiter::Limiter;
use crate::middleware::{admission_middleware, proxy_middleware, MiddlewareConfig};

/// Wires the configured engine and middleware flavor onto a listener.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Serves until ctrl-c, then stops the engine.
    pub async fn run(self) -> Result<(), GatekeeperError> {
        let limiter = Arc::new(match self.config.engine {
            EngineKind::Local => Limiter::local(&self.config.local)?,
            EngineKind::Distributed => Limiter::distributed(&self.config.distributed).await?,
        });

        let middleware_config = match self.config.engine {
            EngineKind::Local => MiddlewareConfig::from(&self.config.local),
            EngineKind::Distributed => MiddlewareConfig::from(&self.config.distributed),
        };

        let router = if self.config.proxy {
            proxy_middleware(limiter.clone(), &middleware_config).await?
        } else {
            admission_middleware(limiter.clone(), &middleware_config).await?
        };
        let router = router.layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.config.bind_address).await.map_err(|e| {
            GatekeeperError::Io(format!("failed to bind {}: {}", self.config.bind_address, e))
        })?;
        info!(
            address = %self.config.bind_address,
            engine = ?self.config.engine,
            proxy = self.config.proxy,
            "admission controller listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| GatekeeperError::Io(e.to_string()))?;

        limiter.stop().await;
        info!("admission controller stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
}
