//! Forward proxy: routes each inbound request to plain forwarding, a raw
//! CONNECT tunnel, or TLS interception, and records what it sees.

mod admission;
mod body;
mod conn;
mod connect;
mod forward;
mod headers;

pub use admission::CaptureAdmission;
pub use body::{read_body_with_limit, BodyLimitError, ProxyBody};
pub use conn::{serve_connection, ConnectionSignals};
pub use headers::{
    header_values, is_hop_by_hop, outbound_request_headers, relayed_response_headers,
    strip_hop_by_hop, HOP_BY_HOP_HEADERS,
};

use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::capture::CaptureStore;
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::tls::CertificateAuthority;

/// Per-request view of where a request came from
#[derive(Clone)]
pub struct RequestContext {
    pub client_addr: SocketAddr,
    /// Set for requests read off a decrypted CONNECT stream
    pub intercepted: Option<Arc<InterceptedTunnel>>,
    pub signals: ConnectionSignals,
}

impl RequestContext {
    pub fn new(client_addr: SocketAddr, signals: ConnectionSignals) -> Self {
        Self {
            client_addr,
            intercepted: None,
            signals,
        }
    }
}

/// The CONNECT target and negotiated client-side TLS parameters of an
/// intercepted session
#[derive(Debug, Clone)]
pub struct InterceptedTunnel {
    pub authority: String,
    pub tls_version: Option<String>,
    pub tls_cipher: Option<String>,
}

pub struct ProxyHandler {
    config: Arc<Config>,
    store: Arc<CaptureStore>,
    ca: Option<Arc<CertificateAuthority>>,
    client: reqwest::Client,
    admission: CaptureAdmission,
}

impl ProxyHandler {
    /// Build the handler and its upstream client.
    ///
    /// Interception is only possible when `ca` is provided.
    pub fn new(
        config: Arc<Config>,
        store: Arc<CaptureStore>,
        ca: Option<Arc<CertificateAuthority>>,
    ) -> Result<Self> {
        let client = build_upstream_client(&config)?;
        let admission = CaptureAdmission::from_config(&config);
        Ok(Self {
            config,
            store,
            ca,
            client,
            admission,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn admission(&self) -> &CaptureAdmission {
        &self.admission
    }

    pub fn should_capture(&self, host: &str) -> bool {
        self.admission.should_capture(host)
    }

    /// Single dispatch point for every request on a proxied connection
    pub async fn handle(self: Arc<Self>, req: Request<Incoming>, ctx: RequestContext) -> Response<ProxyBody> {
        tracing::debug!(
            method = %req.method(),
            uri = %req.uri(),
            client = %ctx.client_addr,
            intercepted = ctx.intercepted.is_some(),
            "Proxy request"
        );

        if req.method() == Method::CONNECT {
            if ctx.intercepted.is_some() {
                return body::text_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "CONNECT is not allowed inside an intercepted tunnel",
                );
            }
            return self.handle_connect(req, ctx).await;
        }

        self.forward(req, ctx).await
    }
}

fn build_upstream_client(config: &Config) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(config.upstream_timeout());

    if let Some(path) = &config.upstream_ca_cert_path {
        let pem = std::fs::read(path)?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            ConfigError::Validation(format!(
                "invalid upstream CA certificate {}: {e}",
                path.display()
            ))
        })?;
        builder = builder.add_root_certificate(cert);
    }

    let client = builder
        .build()
        .map_err(|e| ConfigError::Validation(format!("failed to build upstream client: {e}")))?;
    Ok(client)
}

/// Flatten an error and its sources into one line
pub(crate) fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}
