use http::uri::Authority;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::ProtocolVersion;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use super::body::{self, ProxyBody};
use super::conn::serve_connection_boxed;
use super::{InterceptedTunnel, ProxyHandler, RequestContext};
use crate::host::normalize_host;
use crate::tls::CertificateAuthority;

const DEFAULT_TLS_PORT: u16 = 443;

impl ProxyHandler {
    /// Answer a CONNECT, either as a blind tunnel or by terminating TLS.
    ///
    /// Interception needs a CA and a capture-eligible host; anything else
    /// is tunneled untouched.
    pub(super) async fn handle_connect(
        self: Arc<Self>,
        req: Request<Incoming>,
        ctx: RequestContext,
    ) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return body::text_response(
                StatusCode::BAD_REQUEST,
                "CONNECT target must be in host:port form",
            );
        };
        let host = normalize_host(authority.host());

        let ca = self
            .ca
            .clone()
            .filter(|_| self.admission.should_capture(&host));
        match ca {
            Some(ca) => self.intercept(req, authority, ca, ctx),
            None => self.tunnel(req, authority, ctx).await,
        }
    }

    /// Dial the origin, then splice client and origin bytes once the client
    /// connection is released by the HTTP layer.
    async fn tunnel(
        &self,
        req: Request<Incoming>,
        authority: Authority,
        ctx: RequestContext,
    ) -> Response<ProxyBody> {
        let target = format!(
            "{}:{}",
            authority.host(),
            authority.port_u16().unwrap_or(DEFAULT_TLS_PORT)
        );

        let dial = tokio::time::timeout(self.config.upstream_timeout(), TcpStream::connect(&target));
        let mut upstream = match dial.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(upstream = %target, error = %e, "Tunnel dial failed");
                return body::text_response(
                    StatusCode::BAD_GATEWAY,
                    format!("Failed to connect to {target}: {e}"),
                );
            }
            Err(_) => {
                tracing::warn!(upstream = %target, "Tunnel dial timed out");
                return body::text_response(
                    StatusCode::BAD_GATEWAY,
                    format!("Timed out connecting to {target}"),
                );
            }
        };

        let force = ctx.signals.force.clone();
        ctx.signals.tracker.spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(upstream = %target, error = %e, "CONNECT upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);

            tokio::select! {
                result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => match result {
                    Ok((sent, received)) => tracing::debug!(
                        upstream = %target,
                        sent,
                        received,
                        "Tunnel closed"
                    ),
                    Err(e) => tracing::debug!(upstream = %target, error = %e, "Tunnel ended with error"),
                },
                _ = force.cancelled() => {
                    tracing::debug!(upstream = %target, "Tunnel closed by shutdown");
                }
            }
        });

        body::empty_response(StatusCode::OK)
    }

    /// Acknowledge the CONNECT, then act as the origin: present a leaf
    /// certificate for the host and serve the decrypted requests one after
    /// another on the same stream.
    fn intercept(
        self: Arc<Self>,
        req: Request<Incoming>,
        authority: Authority,
        ca: Arc<CertificateAuthority>,
        ctx: RequestContext,
    ) -> Response<ProxyBody> {
        let tracker = ctx.signals.tracker.clone();

        tracker.spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(authority = %authority, error = %e, "CONNECT upgrade failed");
                    return;
                }
            };

            let host = normalize_host(authority.host());
            let server_config = match ca.server_config_for(&host).await {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(host = %host, error = %e, "Could not issue leaf certificate");
                    return;
                }
            };

            let handshake = TlsAcceptor::from(server_config).accept(TokioIo::new(upgraded));
            let tls = match tokio::time::timeout(self.config.read_timeout(), handshake).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    // Usually a client that does not trust our CA
                    tracing::debug!(host = %host, error = %e, "Client TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(host = %host, "Client TLS handshake timed out");
                    return;
                }
            };

            let (_, session) = tls.get_ref();
            let tunnel = InterceptedTunnel {
                authority: authority.to_string(),
                tls_version: session.protocol_version().map(describe_tls_version),
                tls_cipher: session
                    .negotiated_cipher_suite()
                    .map(|suite| format!("{:?}", suite.suite())),
            };
            tracing::debug!(
                host = %host,
                tls_version = ?tunnel.tls_version,
                "Intercepting CONNECT session"
            );

            let ctx = RequestContext {
                intercepted: Some(Arc::new(tunnel)),
                ..ctx
            };
            serve_connection_boxed(TokioIo::new(tls), self, ctx).await;
        });

        body::empty_response(StatusCode::OK)
    }
}

fn describe_tls_version(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_2 => "TLS 1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLS 1.3".to_string(),
        other => format!("{other:?}"),
    }
}
