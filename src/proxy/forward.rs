use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use http::request::Parts;
use http::{header, HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use super::body::{self, read_body_with_limit, ProxyBody};
use super::headers::{header_values, outbound_request_headers, relayed_response_headers};
use super::{error_chain, ProxyHandler, RequestContext};
use crate::capture::{CaptureStore, CapturedRequest};
use crate::host::normalize_host;

/// Chunks buffered between the upstream reader and the client writer
const RELAY_CHANNEL_DEPTH: usize = 16;

impl ProxyHandler {
    /// Forward one non-CONNECT request upstream and relay the response.
    ///
    /// Plain proxy requests and requests read off an intercepted tunnel both
    /// land here; the context says which.
    pub(super) async fn forward(&self, req: Request<Incoming>, ctx: RequestContext) -> Response<ProxyBody> {
        let started = Instant::now();
        let (parts, incoming) = req.into_parts();

        let url = match target_url(&parts, &ctx) {
            Ok(url) => url,
            Err(message) => {
                tracing::warn!(uri = %parts.uri, error = %message, "Rejecting request");
                return body::text_response(StatusCode::BAD_REQUEST, message);
            }
        };
        let host = url.host_str().map(normalize_host).unwrap_or_default();

        let request_body = match read_body_with_limit(incoming, self.config.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Request body rejected");
                return body::text_response(e.status_code(), e.to_string());
            }
        };

        let record = self
            .admission
            .should_capture(&host)
            .then(|| request_record(&parts, &url, &host, &request_body, &ctx));

        let mut upstream = self
            .client
            .request(parts.method.clone(), url.clone())
            .headers(outbound_request_headers(&parts.headers));
        if !request_body.is_empty() {
            upstream = upstream.body(request_body);
        }

        match upstream.send().await {
            Ok(response) => self.relay(response, record, started),
            Err(e) => {
                let message = error_chain(&e);
                tracing::warn!(url = %url, error = %message, "Upstream request failed");

                if let Some(mut capture) = record {
                    capture.duration = started.elapsed();
                    self.store.add(capture.with_error(message.clone())).await;
                }
                body::text_response(StatusCode::BAD_GATEWAY, format!("Bad Gateway: {message}"))
            }
        }
    }

    /// Stream the upstream response to the client, teeing the first
    /// `max_body_size` bytes into the capture when one is being recorded.
    fn relay(
        &self,
        response: reqwest::Response,
        record: Option<CapturedRequest>,
        started: Instant,
    ) -> Response<ProxyBody> {
        let status = response.status();
        let upstream_headers = response.headers().clone();

        let body = match record {
            None => StreamBody::new(
                response
                    .bytes_stream()
                    .map_ok(Frame::data)
                    .map_err(io::Error::other),
            )
            .boxed_unsync(),
            Some(mut capture) => {
                capture.status_code = status.as_u16();
                capture.status_text = status.canonical_reason().unwrap_or_default().to_string();
                capture.response_headers = header_values(&upstream_headers);

                let keep_body = !content_type(&upstream_headers)
                    .map(|ct| self.admission.should_exclude_content_type(ct))
                    .unwrap_or(false);

                spawn_tee(
                    response,
                    capture,
                    TeeOptions {
                        keep_body,
                        limit: self.config.max_body_size,
                        started,
                    },
                    Arc::clone(&self.store),
                )
            }
        };

        let mut relayed = Response::new(body);
        *relayed.status_mut() = status;
        *relayed.headers_mut() = relayed_response_headers(&upstream_headers);
        relayed
    }
}

struct TeeOptions {
    keep_body: bool,
    limit: usize,
    started: Instant,
}

fn spawn_tee(
    mut response: reqwest::Response,
    mut capture: CapturedRequest,
    options: TeeOptions,
    store: Arc<CaptureStore>,
) -> ProxyBody {
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(RELAY_CHANNEL_DEPTH);

    tokio::spawn(async move {
        let mut kept = BytesMut::new();
        let mut total: u64 = 0;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    total += chunk.len() as u64;
                    if options.keep_body && kept.len() < options.limit {
                        let take = (options.limit - kept.len()).min(chunk.len());
                        kept.extend_from_slice(&chunk[..take]);
                    }
                    if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                        tracing::debug!(url = %capture.url, "Client went away mid-response");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Status already went out; keep the partial record
                    // without an error so the status stays meaningful.
                    let message = error_chain(&e);
                    tracing::warn!(url = %capture.url, error = %message, "Upstream body failed");
                    let _ = tx.send(Err(io::Error::other(message))).await;
                    break;
                }
            }
        }

        capture.response_body = kept.to_vec();
        capture.response_size = total;
        capture.duration = options.started.elapsed();
        store.add(capture).await;
        drop(tx);
    });

    StreamBody::new(ReceiverStream::new(rx)).boxed_unsync()
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
}

fn request_record(
    parts: &Parts,
    url: &Url,
    host: &str,
    body: &Bytes,
    ctx: &RequestContext,
) -> CapturedRequest {
    let tunnel = ctx.intercepted.as_deref();
    CapturedRequest {
        method: parts.method.to_string(),
        url: url.to_string(),
        host: host.to_string(),
        path: url.path().to_string(),
        request_headers: header_values(&parts.headers),
        request_body: body.to_vec(),
        request_size: body.len() as u64,
        is_https: url.scheme() == "https",
        tls_version: tunnel.and_then(|t| t.tls_version.clone()),
        tls_cipher: tunnel.and_then(|t| t.tls_cipher.clone()),
        client_ip: ctx.client_addr.ip().to_string(),
        client_port: ctx.client_addr.port(),
        ..Default::default()
    }
}

/// Resolve the absolute upstream URL for a request.
///
/// Inside an intercepted tunnel the CONNECT authority is authoritative.
/// Otherwise an absolute-form request line is used as-is, and an
/// origin-form one is completed from the `Host` header.
fn target_url(parts: &Parts, ctx: &RequestContext) -> Result<Url, String> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let raw = if let Some(tunnel) = &ctx.intercepted {
        format!("https://{}{}", tunnel.authority, path_and_query)
    } else if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
        parts.uri.to_string()
    } else {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "Missing Host header for origin-form request".to_string())?;
        format!("http://{host}{path_and_query}")
    };

    Url::parse(&raw).map_err(|e| format!("Invalid target URL '{raw}': {e}"))
}
