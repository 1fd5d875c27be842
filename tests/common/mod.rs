#![allow(dead_code)]

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use tapwire::capture::{CapturedRequest, FilterOptions};
use tapwire::{Config, Server};

/// Origin that answers every request with a small JSON document echoing
/// the method, path, and request body length.
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    if path == "/moved" {
        return Ok(Response::builder()
            .status(302)
            .header("location", "/elsewhere")
            .body(Full::new(Bytes::new()))
            .expect("valid response"));
    }

    if path == "/missing" {
        return Ok(Response::builder()
            .status(404)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from_static(b"not here")))
            .expect("valid response"));
    }

    let payload = format!(
        r#"{{"method":"{method}","path":"{path}","received":{}}}"#,
        body.len()
    );
    Ok(Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .header("x-backend", "echo")
        .body(Full::new(Bytes::from(payload)))
        .expect("valid response"))
}

pub async fn spawn_http_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind backend");
    let addr = listener.local_addr().expect("No backend addr");

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// Same origin behind TLS, with a certificate for `localhost` issued by
/// `ca`.
pub async fn spawn_https_backend(ca: Arc<tapwire::CertificateAuthority>) -> SocketAddr {
    let server_config = ca
        .server_config_for("localhost")
        .await
        .expect("Failed to issue backend certificate");
    let acceptor = TlsAcceptor::from(server_config);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind TLS backend");
    let addr = listener.local_addr().expect("No backend addr");

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// Raw TCP echo server for tunnel tests
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("No echo addr");

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A port nothing listens on
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let port = listener.local_addr().expect("No addr").port();
    drop(listener);
    port
}

pub fn test_config() -> Config {
    Config::default()
        .with_listen_addr("127.0.0.1:0")
        .with_upstream_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(2))
}

pub fn intercepting_config(dir: &Path) -> Config {
    test_config()
        .with_intercept_https(true)
        .with_ca_paths(dir.join("ca.crt"), dir.join("ca.key"))
}

pub async fn start(config: Config) -> (Server, SocketAddr) {
    let server = Server::new(config).expect("Failed to create server");
    let addr = server
        .start(CancellationToken::new())
        .await
        .expect("Failed to start server");
    (server, addr)
}

pub fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).expect("valid proxy url"))
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build client")
}

/// Captures are recorded once the response body has been relayed, so
/// poll rather than assume they are visible as soon as the client returns.
pub async fn wait_for_captures(server: &Server, count: usize) -> Vec<Arc<CapturedRequest>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let captures = server.captures(&FilterOptions::default()).await;
        if captures.len() >= count || tokio::time::Instant::now() > deadline {
            return captures;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
