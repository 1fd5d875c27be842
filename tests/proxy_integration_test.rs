mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::*;
use tapwire::capture::{CapturedRequest, FilterOptions};
use tapwire::CertificateAuthority;

#[tokio::test]
async fn test_plain_http_is_forwarded_and_captured() {
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(test_config()).await;
    let client = proxied_client(proxy);

    let response = client
        .post(format!("http://{backend}/api/items?page=2"))
        .header("x-request-tag", "abc")
        .body("hello")
        .send()
        .await
        .expect("Request through proxy failed");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-backend").and_then(|v| v.to_str().ok()),
        Some("echo")
    );
    let body = response.text().await.expect("Failed to read body");
    assert!(body.contains(r#""path":"/api/items""#));
    assert!(body.contains(r#""received":5"#));

    let captures = wait_for_captures(&server, 1).await;
    assert_eq!(captures.len(), 1);
    let capture = &captures[0];
    assert!(!capture.id.is_empty());
    assert_eq!(capture.method, "POST");
    assert_eq!(capture.host, "127.0.0.1");
    assert_eq!(capture.path, "/api/items");
    assert_eq!(capture.url, format!("http://{backend}/api/items?page=2"));
    assert_eq!(capture.status_code, 200);
    assert_eq!(capture.status_text, "OK");
    assert_eq!(capture.request_body, b"hello");
    assert_eq!(capture.request_size, 5);
    assert_eq!(capture.request_header("x-request-tag"), Some("abc"));
    assert_eq!(capture.response_body, body.as_bytes());
    assert_eq!(capture.response_size, body.len() as u64);
    assert_eq!(capture.content_type(), Some("application/json"));
    assert!(!capture.is_https);
    assert!(capture.error.is_none());
    assert_eq!(capture.client_ip, "127.0.0.1");

    let fetched = server
        .get_capture(&capture.id)
        .await
        .expect("Capture not retrievable by id");
    assert!(Arc::ptr_eq(&fetched, capture));

    server.stop().await;
}

#[tokio::test]
async fn test_upstream_status_is_relayed() {
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(test_config()).await;

    let response = proxied_client(proxy)
        .get(format!("http://{backend}/missing"))
        .send()
        .await
        .expect("Request through proxy failed");
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.expect("body"), "not here");

    let captures = wait_for_captures(&server, 1).await;
    assert_eq!(captures[0].status_code, 404);
    assert!(!captures[0].is_error());

    server.stop().await;
}

#[tokio::test]
async fn test_redirect_relayed_not_followed() {
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(test_config()).await;
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).expect("valid proxy url"))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build client");

    let response = client
        .get(format!("http://{backend}/moved"))
        .send()
        .await
        .expect("Request through proxy failed");
    assert_eq!(response.status(), 302);
    assert_eq!(
        response.headers().get("location").and_then(|v| v.to_str().ok()),
        Some("/elsewhere")
    );
    response.bytes().await.expect("body");

    let captures = wait_for_captures(&server, 1).await;
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].status_code, 302);
    assert_eq!(captures[0].path, "/moved");
    assert_eq!(captures[0].response_header("location"), Some("/elsewhere"));

    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_upstream_yields_502_and_error_capture() {
    let (server, proxy) = start(test_config()).await;
    let port = closed_port();

    let response = proxied_client(proxy)
        .get(format!("http://127.0.0.1:{port}/nothing"))
        .send()
        .await
        .expect("Proxy should answer");
    assert_eq!(response.status(), 502);
    let body = response.text().await.expect("body");
    assert!(body.starts_with("Bad Gateway"));

    let captures = wait_for_captures(&server, 1).await;
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].status_code, 0);
    assert!(captures[0].error.is_some());
    assert!(captures[0].is_error());

    server.stop().await;
}

#[tokio::test]
async fn test_excluded_host_is_forwarded_but_not_captured() {
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(test_config().with_exclude_hosts(["127.0.0.1"])).await;

    let response = proxied_client(proxy)
        .get(format!("http://{backend}/quiet"))
        .send()
        .await
        .expect("Request through proxy failed");
    assert_eq!(response.status(), 200);
    response.text().await.expect("body");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.stats().await.total_count, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_excluded_content_type_keeps_metadata_only() {
    let backend = spawn_http_backend().await;
    let (server, proxy) =
        start(test_config().with_exclude_content_types(["application/json"])).await;

    let body = proxied_client(proxy)
        .get(format!("http://{backend}/data"))
        .send()
        .await
        .expect("Request through proxy failed")
        .text()
        .await
        .expect("body");
    assert!(!body.is_empty());

    let captures = wait_for_captures(&server, 1).await;
    assert!(captures[0].response_body.is_empty());
    assert_eq!(captures[0].response_size, body.len() as u64);

    server.stop().await;
}

#[tokio::test]
async fn test_oversize_request_body_rejected() {
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(test_config().with_max_body_size(16)).await;

    let response = proxied_client(proxy)
        .post(format!("http://{backend}/upload"))
        .body(vec![b'x'; 64])
        .send()
        .await
        .expect("Proxy should answer");
    assert_eq!(response.status(), 413);

    server.stop().await;
}

#[tokio::test]
async fn test_response_body_capture_truncated_to_limit() {
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(test_config().with_max_body_size(10)).await;

    let body = proxied_client(proxy)
        .get(format!("http://{backend}/long-enough-path"))
        .send()
        .await
        .expect("Request through proxy failed")
        .text()
        .await
        .expect("body");
    assert!(body.len() > 10, "client must receive the full body");

    let captures = wait_for_captures(&server, 1).await;
    assert_eq!(captures[0].response_body.len(), 10);
    assert_eq!(captures[0].response_size, body.len() as u64);

    server.stop().await;
}

#[tokio::test]
async fn test_connect_tunnel_relays_bytes() {
    let echo = spawn_tcp_echo().await;
    let (server, proxy) = start(test_config()).await;

    let mut stream = TcpStream::connect(proxy).await.expect("Failed to reach proxy");
    stream
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .expect("Failed to send CONNECT");

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("Failed to read response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).expect("utf8 head");
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

    stream.write_all(b"ping through tunnel").await.expect("write");
    let mut echoed = [0u8; 19];
    stream.read_exact(&mut echoed).await.expect("read");
    assert_eq!(&echoed, b"ping through tunnel");

    // tunneled traffic is opaque and never recorded
    assert_eq!(server.stats().await.total_count, 0);

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_connect_to_closed_port_returns_502() {
    let (server, proxy) = start(test_config()).await;
    let port = closed_port();

    let mut stream = TcpStream::connect(proxy).await.expect("Failed to reach proxy");
    stream
        .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
        .await
        .expect("Failed to send CONNECT");

    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await.expect("Failed to read");
    let text = String::from_utf8_lossy(&buf[..n]);
    assert!(text.starts_with("HTTP/1.1 502"), "unexpected response: {text}");

    server.stop().await;
}

#[tokio::test]
async fn test_https_interception_captures_decrypted_exchange() {
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");

    // the origin's certificate comes from an unrelated authority the proxy
    // is told to trust
    let origin_ca = Arc::new(
        CertificateAuthority::generate(&dir.path().join("origin.crt"), &dir.path().join("origin.key"))
            .expect("Failed to create origin CA"),
    );
    let backend = spawn_https_backend(Arc::clone(&origin_ca)).await;

    let config = intercepting_config(dir.path()).with_upstream_ca_cert(dir.path().join("origin.crt"));
    let (server, proxy) = start(config).await;

    let proxy_ca = reqwest::Certificate::from_pem(
        server.ca_cert_pem().expect("CA available").as_bytes(),
    )
    .expect("Valid CA PEM");
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).expect("valid proxy url"))
        .add_root_certificate(proxy_ca)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build client");

    let url = format!("https://localhost:{}/secure/resource", backend.port());
    let response = client.get(&url).send().await.expect("HTTPS request failed");
    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains(r#""path":"/secure/resource""#));

    let captures = wait_for_captures(&server, 1).await;
    assert_eq!(captures.len(), 1);
    let capture = &captures[0];
    assert!(capture.is_https);
    assert_eq!(capture.url, url);
    assert_eq!(capture.host, "localhost");
    assert_eq!(capture.status_code, 200);
    assert_eq!(capture.response_body, body.as_bytes());
    assert!(capture.tls_version.is_some());
    assert!(capture.tls_cipher.is_some());

    let https_only = server
        .captures(&FilterOptions {
            https_only: true,
            ..Default::default()
        })
        .await;
    assert_eq!(https_only.len(), 1);

    let ca = server.certificate_authority().expect("CA present");
    assert_eq!(ca.cached_hosts(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_intercepted_keep_alive_serves_sequential_requests() {
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let origin_ca = Arc::new(
        CertificateAuthority::generate(&dir.path().join("origin.crt"), &dir.path().join("origin.key"))
            .expect("Failed to create origin CA"),
    );
    let backend = spawn_https_backend(origin_ca).await;

    let config = intercepting_config(dir.path()).with_upstream_ca_cert(dir.path().join("origin.crt"));
    let (server, proxy) = start(config).await;

    let proxy_ca = reqwest::Certificate::from_pem(
        server.ca_cert_pem().expect("CA available").as_bytes(),
    )
    .expect("Valid CA PEM");
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).expect("valid proxy url"))
        .add_root_certificate(proxy_ca)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build client");

    for i in 0..3 {
        let response = client
            .get(format!("https://localhost:{}/item/{i}", backend.port()))
            .send()
            .await
            .expect("HTTPS request failed");
        assert_eq!(response.status(), 200);
        response.text().await.expect("body");
    }

    let captures = wait_for_captures(&server, 3).await;
    assert_eq!(captures.len(), 3);
    assert_eq!(captures[0].path, "/item/2");
    assert_eq!(captures[2].path, "/item/0");

    // one client connection, hence one CONNECT tunnel, carried all three
    let port = captures[0].client_port;
    assert!(captures.iter().all(|c| c.client_port == port && c.is_https));

    let ca = server.certificate_authority().expect("CA present");
    assert_eq!(ca.cached_hosts(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_interception_upstream_tls_failure_is_recorded() {
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    // plain HTTP origin: the proxy's TLS dial to it cannot succeed
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(intercepting_config(dir.path())).await;

    let proxy_ca = reqwest::Certificate::from_pem(
        server.ca_cert_pem().expect("CA available").as_bytes(),
    )
    .expect("Valid CA PEM");
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).expect("valid proxy url"))
        .add_root_certificate(proxy_ca)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build client");

    let response = client
        .get(format!("https://localhost:{}/", backend.port()))
        .send()
        .await
        .expect("Proxy should answer inside the tunnel");
    assert_eq!(response.status(), 502);

    let captures = wait_for_captures(&server, 1).await;
    assert_eq!(captures.len(), 1);
    assert!(captures[0].is_https);
    assert_eq!(captures[0].status_code, 0);
    assert!(captures[0].error.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_excluded_host_is_tunneled_even_when_intercepting() {
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let echo = spawn_tcp_echo().await;
    let config = intercepting_config(dir.path()).with_exclude_hosts(["127.0.0.1"]);
    let (server, proxy) = start(config).await;

    let mut stream = TcpStream::connect(proxy).await.expect("Failed to reach proxy");
    stream
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .expect("Failed to send CONNECT");
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("read head");
        head.push(byte[0]);
    }

    // raw bytes come back untouched, so no TLS was terminated
    stream.write_all(b"raw").await.expect("write");
    let mut echoed = [0u8; 3];
    stream.read_exact(&mut echoed).await.expect("read");
    assert_eq!(&echoed, b"raw");

    let ca = server.certificate_authority().expect("CA present");
    assert_eq!(ca.cached_hosts(), 0);

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_listener_notified_of_proxied_capture() {
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(test_config()).await;
    let (handle, mut rx) = server.subscribe(8);

    proxied_client(proxy)
        .get(format!("http://{backend}/notify"))
        .send()
        .await
        .expect("Request through proxy failed")
        .text()
        .await
        .expect("body");

    let capture: Arc<CapturedRequest> = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("No capture event")
        .expect("Channel closed");
    assert_eq!(capture.path, "/notify");

    assert!(server.remove_listener(handle));
    assert!(!server.remove_listener(handle));

    server.stop().await;
}

#[tokio::test]
async fn test_graceful_stop_lets_open_connection_finish() {
    let backend = spawn_http_backend().await;
    let (server, proxy) = start(test_config()).await;
    let client = proxied_client(proxy);

    // keep-alive connection established before shutdown
    client
        .get(format!("http://{backend}/warm"))
        .send()
        .await
        .expect("Request through proxy failed")
        .text()
        .await
        .expect("body");

    let started = tokio::time::Instant::now();
    server.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2) + Duration::from_millis(500));
    assert!(!server.is_running().await);

    // listener is released once stop returns
    assert!(TcpStream::connect(proxy).await.is_err());
}
