use futures::future::BoxFuture;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioTimer;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{ProxyHandler, RequestContext};

/// Shutdown plumbing shared by every connection of one server run.
///
/// `graceful` asks connections to finish in-flight exchanges and stop
/// accepting new requests; `force` drops whatever is still open. Tunnels and
/// intercepted sessions are spawned on `tracker` so the server can wait for
/// them.
#[derive(Clone, Default)]
pub struct ConnectionSignals {
    pub tracker: TaskTracker,
    pub graceful: CancellationToken,
    pub force: CancellationToken,
}

impl ConnectionSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Serve HTTP/1.1 on one connection until the peer hangs up or shutdown
/// completes. Used for accepted sockets and for decrypted MITM streams.
pub async fn serve_connection<I>(io: I, handler: Arc<ProxyHandler>, ctx: RequestContext)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let signals = ctx.signals.clone();
    let client = ctx.client_addr;
    let read_timeout = handler.config().read_timeout();

    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(handler.handle(req, ctx).await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .keep_alive(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            log_outcome(client, result);
            return;
        }
        _ = signals.graceful.cancelled() => {
            conn.as_mut().graceful_shutdown();
        }
    }

    tokio::select! {
        result = conn.as_mut() => log_outcome(client, result),
        _ = signals.force.cancelled() => {
            tracing::debug!(client = %client, "Force closing connection");
        }
    }
}

/// Boxed form of [`serve_connection`] for nesting inside a CONNECT session
pub(crate) fn serve_connection_boxed<I>(
    io: I,
    handler: Arc<ProxyHandler>,
    ctx: RequestContext,
) -> BoxFuture<'static, ()>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    Box::pin(serve_connection(io, handler, ctx))
}

fn log_outcome(client: std::net::SocketAddr, result: Result<(), hyper::Error>) {
    match result {
        Ok(()) => tracing::debug!(client = %client, "Connection closed"),
        Err(e) if e.is_incomplete_message() || e.is_timeout() => {
            tracing::debug!(client = %client, error = %e, "Connection dropped")
        }
        Err(e) => tracing::warn!(client = %client, error = %e, "Connection error"),
    }
}
