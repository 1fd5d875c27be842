use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use hyper_util::rt::TokioIo;

use crate::proxy::{serve_connection, ConnectionSignals, ProxyHandler, RequestContext};

/// Back-off after a failed accept, e.g. when out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) enum ServerState {
    Stopped,
    Running(RunningServer),
}

impl ServerState {
    pub(crate) fn is_running(&self) -> bool {
        matches!(self, ServerState::Running(_))
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerState::Running(running) => Some(running.local_addr),
            ServerState::Stopped => None,
        }
    }
}

pub(crate) struct RunningServer {
    pub(crate) local_addr: SocketAddr,
    pub(crate) signals: ConnectionSignals,
    pub(crate) accept_task: JoinHandle<()>,
}

impl RunningServer {
    pub(crate) fn spawn(listener: TcpListener, local_addr: SocketAddr, handler: Arc<ProxyHandler>) -> Self {
        let signals = ConnectionSignals::new();
        let accept_task = tokio::spawn(accept_loop(listener, handler, signals.clone()));
        Self {
            local_addr,
            signals,
            accept_task,
        }
    }

    /// Stop accepting, let open connections finish within `grace`, then
    /// force-close the rest.
    pub(crate) async fn shutdown(self, grace: Duration) {
        self.signals.graceful.cancel();
        if let Err(e) = self.accept_task.await {
            tracing::warn!(error = %e, "Accept loop ended abnormally");
        }

        self.signals.tracker.close();
        let open = self.signals.tracker.len();
        if open > 0 {
            tracing::info!(open, "Waiting for open connections to finish");
        }

        if tokio::time::timeout(grace, self.signals.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.signals.tracker.len(),
                "Graceful shutdown timed out, force closing connections"
            );
        }
        self.signals.force.cancel();
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<ProxyHandler>, signals: ConnectionSignals) {
    loop {
        tokio::select! {
            _ = signals.graceful.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(client = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tracing::debug!(client = %peer, "Accepted connection");

                    let ctx = RequestContext::new(peer, signals.clone());
                    signals
                        .tracker
                        .spawn(serve_connection(TokioIo::new(stream), Arc::clone(&handler), ctx));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}
