//! CONNECT tunnel integration tests: raw pipes, handshake sniffing,
//! and full TLS interception.

mod common;

use common::{
    header_value, http_response, init_crypto, plant_ca, read_head, response_parts,
    FixedConnectPatcher, TestProxy, TestUpstream,
};
use rustls::pki_types::ServerName;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use violentproxy::patch::{ConnectDecision, HELLO_SCRIPT};

/// `Pipe` splices a raw TCP tunnel with no inspection.
#[tokio::test]
async fn test_pipe_decision_splices_raw_tunnel() {
    let upstream = TestUpstream::start_echo().await;
    let proxy = TestProxy::start().await;
    proxy
        .engine
        .set_connect_patcher(Arc::new(FixedConnectPatcher(ConnectDecision::Pipe)));

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = upstream.port()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = String::from_utf8(read_head(&mut stream).await).unwrap();
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established\r\n"),
        "head: {}",
        head
    );

    stream.write_all(b"hello tunnel").await.unwrap();
    let mut echoed = vec![0u8; 12];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"hello tunnel");

    proxy.shutdown();
    upstream.shutdown();
}

/// Keep-alive headers on the CONNECT request are echoed on the 200
/// line's headers.
#[tokio::test]
async fn test_connect_echoes_keep_alive_headers() {
    let upstream = TestUpstream::start_echo().await;
    let proxy = TestProxy::start().await;
    proxy
        .engine
        .set_connect_patcher(Arc::new(FixedConnectPatcher(ConnectDecision::Pipe)));

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
         Proxy-Connection: keep-alive\r\n\r\n",
        port = upstream.port()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = String::from_utf8(read_head(&mut stream).await).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 Connection Established\r\n"));
    assert!(head.contains("Proxy-Connection: keep-alive\r\n"), "head: {}", head);
    assert!(!head.contains("\nConnection: keep-alive"), "head: {}", head);

    proxy.shutdown();
    upstream.shutdown();
}

/// `Deny` closes the tunnel without any response bytes.
#[tokio::test]
async fn test_deny_decision_closes_without_response() {
    let proxy = TestProxy::start().await;
    proxy
        .engine
        .set_connect_patcher(Arc::new(FixedConnectPatcher(ConnectDecision::Deny)));

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n")
        .await
        .unwrap();

    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    assert!(out.is_empty(), "expected no bytes, got {:?}", out);

    proxy.shutdown();
}

/// Malformed CONNECT targets drop the connection silently.
#[tokio::test]
async fn test_bad_connect_target_closes_without_response() {
    let proxy = TestProxy::start().await;

    for target in ["nodotshere:443", "*.example.org:443"] {
        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        let request = format!("CONNECT {} HTTP/1.1\r\n\r\n", target);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out).await;
        assert!(out.is_empty(), "{}: expected no bytes", target);
    }

    proxy.shutdown();
}

/// Non-TLS bytes on an allowed tunnel close it; plain HTTP over
/// CONNECT is terminated.
#[tokio::test]
async fn test_non_tls_tunnel_payload_is_rejected() {
    let proxy = TestProxy::start().await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n")
        .await
        .unwrap();

    let head = String::from_utf8(read_head(&mut stream).await).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 Connection Established\r\n"));

    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    assert!(out.is_empty(), "expected the tunnel to close, got {:?}", out);

    proxy.shutdown();
}

/// Full interception: the tunnel's TLS is terminated with a leaf from
/// the proxy CA, the decrypted request is re-issued upstream over TLS,
/// and the patched response comes back through the tunnel.
#[tokio::test]
async fn test_tls_tunnel_is_intercepted_end_to_end() {
    init_crypto();

    let cert_dir = tempfile::tempdir().unwrap();
    let ca = plant_ca(cert_dir.path());

    // Upstream TLS server presenting a leaf from the same CA.
    let upstream_leaf = ca.issue_leaf(&["localhost".to_string()], &[]).unwrap();
    let upstream_config = upstream_leaf.server_config(ca.cert_der()).unwrap();
    let upstream = TestUpstream::start_tls(
        Arc::new(upstream_config),
        http_response("200 OK", &[("Content-Type", "text/html")], b"<head></head>"),
    )
    .await;

    let proxy = TestProxy::start_with(cert_dir, Some(upstream.port())).await;

    // The engine must trust the planted CA for its upstream dial.
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.cert_der().clone()).unwrap();
    let upstream_tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots.clone())
        .with_no_client_auth();
    proxy.engine.set_upstream_tls(Arc::new(upstream_tls));

    // Tunnel in, then speak TLS as a client that trusts the proxy CA.
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"CONNECT localhost:443 HTTP/1.1\r\nHost: localhost:443\r\n\r\n")
        .await
        .unwrap();
    let head = String::from_utf8(read_head(&mut stream).await).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 Connection Established\r\n"));

    let client_tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_tls));
    let mut tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .expect("TLS handshake through the intercepted tunnel");

    tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nAccept: text/html\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    let _ = tls.read_to_end(&mut raw).await;
    let (head, body) = response_parts(&raw);

    assert!(head.starts_with("HTTP/1.1 200"), "head: {}", head);
    let expected = format!("<head>{}</head>", HELLO_SCRIPT);
    assert_eq!(String::from_utf8(body.clone()).unwrap(), expected);
    assert_eq!(
        header_value(&head, "content-length").unwrap(),
        body.len().to_string()
    );
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);

    proxy.shutdown();
    upstream.shutdown();
}
