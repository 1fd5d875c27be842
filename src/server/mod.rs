//! Proxy server lifecycle and control surface.
//!
//! A [`Server`] moves between stopped and running. Starting binds the
//! listener and serves on background tasks; stopping drains open
//! connections for a bounded grace period before closing them.

mod lifecycle;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::capture::{
    CaptureListener, CaptureStats, CaptureStore, CapturedRequest, FilterOptions, ListenerHandle,
};
use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::proxy::ProxyHandler;
use crate::tls::CertificateAuthority;
use lifecycle::{RunningServer, ServerState};

#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    store: Arc<CaptureStore>,
    ca: Option<Arc<CertificateAuthority>>,
    handler: Arc<ProxyHandler>,
    state: RwLock<ServerState>,
}

impl Server {
    /// Build a stopped server.
    ///
    /// With interception enabled the CA is loaded from the configured paths,
    /// or generated there when `auto_generate_ca` allows it.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let store = Arc::new(CaptureStore::new(config.effective_buffer_size()));

        let ca = if config.intercept_https {
            let ca = CertificateAuthority::load_or_generate(
                &config.ca_cert_path,
                &config.ca_key_path,
                config.auto_generate_ca,
            )?;
            Some(Arc::new(ca))
        } else {
            None
        };

        let handler = Arc::new(ProxyHandler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            ca.clone(),
        )?);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                ca,
                handler,
                state: RwLock::new(ServerState::Stopped),
            }),
        })
    }

    /// Bind and start serving in the background.
    ///
    /// Cancelling `cancel` later has the same effect as [`Server::stop`].
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn start(&self, cancel: CancellationToken) -> Result<SocketAddr> {
        let mut state = self.inner.state.write().await;
        if state.is_running() {
            return Err(ServerError::AlreadyRunning.into());
        }

        let addr = self.inner.config.listen_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let running = RunningServer::spawn(listener, local_addr, Arc::clone(&self.inner.handler));
        let stopped = running.signals.graceful.clone();

        let server = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Cancellation requested, stopping proxy");
                    server.stop().await;
                }
                // stopped through another path
                _ = stopped.cancelled() => {}
            }
        });

        *state = ServerState::Running(running);
        tracing::info!(
            listen_addr = %local_addr,
            intercept_https = self.inner.config.intercept_https,
            "Proxy server started"
        );
        Ok(local_addr)
    }

    /// Stop serving. Does nothing when already stopped.
    pub async fn stop(&self) {
        let mut state = self.inner.state.write().await;
        let running = match std::mem::replace(&mut *state, ServerState::Stopped) {
            ServerState::Running(running) => running,
            ServerState::Stopped => return,
        };

        tracing::info!(listen_addr = %running.local_addr, "Stopping proxy server");
        running.shutdown(self.inner.config.shutdown_timeout()).await;
        tracing::info!("Proxy server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.read().await.is_running()
    }

    /// Address actually bound while running
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.state.read().await.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn capture_store(&self) -> Arc<CaptureStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn should_capture(&self, host: &str) -> bool {
        self.inner.handler.should_capture(host)
    }

    pub async fn captures(&self, filter: &FilterOptions) -> Vec<Arc<CapturedRequest>> {
        self.inner.store.list(filter).await
    }

    pub async fn get_capture(&self, id: &str) -> Option<Arc<CapturedRequest>> {
        self.inner.store.get(id).await
    }

    pub async fn stats(&self) -> CaptureStats {
        self.inner.store.stats().await
    }

    pub async fn clear_captures(&self) {
        self.inner.store.clear().await
    }

    pub fn certificate_authority(&self) -> Option<Arc<CertificateAuthority>> {
        self.inner.ca.clone()
    }

    /// CA certificate PEM; errors when interception is disabled
    pub fn ca_cert_pem(&self) -> Result<String> {
        let ca = self.inner.ca.as_ref().ok_or(ServerError::InterceptionDisabled)?;
        Ok(ca.ca_cert_pem().to_string())
    }

    pub fn export_ca_cert(&self, path: &Path) -> Result<()> {
        let ca = self.inner.ca.as_ref().ok_or(ServerError::InterceptionDisabled)?;
        ca.export_ca_cert(path)?;
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn CaptureListener>) -> ListenerHandle {
        self.inner.store.add_listener(listener)
    }

    pub fn subscribe(
        &self,
        capacity: usize,
    ) -> (ListenerHandle, mpsc::Receiver<Arc<CapturedRequest>>) {
        self.inner.store.subscribe(capacity)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.store.remove_listener(handle)
    }
}
