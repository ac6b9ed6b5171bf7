use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{create_router, AppState};
use crate::config::ServerConfig;
use crate::store::{SqliteStore, Store};

pub struct RelayServer {
    config: ServerConfig,
    state: AppState,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

/// Open the store named by `config`.
pub async fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn Store>> {
    let store = if config.is_in_memory() {
        SqliteStore::open_in_memory().await?
    } else {
        SqliteStore::new(&config.database_path).await?
    };
    Ok(Arc::new(store))
}

impl RelayServer {
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let store = open_store(&config).await?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState::new(&config, store, shutdown_rx)?;
        Ok(Self {
            config,
            state,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        create_router(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("duet-relay listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(Self::shutdown_signal(self.shutdown_tx.clone()))
            .await?;
        info!("duet-relay stopped");
        Ok(())
    }

    /// Resolves on SIGTERM, SIGINT or `shutdown()`, and tells live
    /// connections to close.
    async fn shutdown_signal(shutdown_tx: Arc<watch::Sender<bool>>) {
        let mut shutdown = shutdown_tx.subscribe();
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm {
                        Some(ref mut sigterm) => {
                            sigterm.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Shutdown requested");
            }
        }
        shutdown_tx.send_replace(true);
    }

    /// Stop accepting requests and close live connections.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
