//! The connect engine: CONNECT tunnels, handshake sniffing, and
//! splicing.

use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::patch::ConnectDecision;

const MAX_HEAD_BYTES: usize = 8192;

/// TLS record sniff on the first tunnelled bytes: handshake content
/// type, record major version 3, minor within the accepted range.
pub fn is_tls_client_hello(b0: u8, b1: u8, b2: u8) -> bool {
    b0 == 0x16 && b1 == 0x03 && b2 <= 0x05
}

/// Validate and split a CONNECT target of the form `host:port`.
///
/// The host must look like a name the proxy can dial: at least one dot
/// (or `localhost`) and no wildcard. An unparseable port falls back to
/// 443.
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let mut parts = target.split(':');
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::malformed(format!("bad CONNECT target '{}'", target)));
    };
    if host.is_empty() || host.contains('*') || (!host.contains('.') && host != "localhost") {
        return Err(Error::malformed(format!("bad CONNECT host '{}'", host)));
    }
    let port = port.parse::<u16>().unwrap_or(443);
    Ok((host.to_string(), port))
}

struct ConnectHead {
    host: String,
    port: u16,
    version: String,
    echo_connection: bool,
    echo_proxy_connection: bool,
}

fn parse_connect_head(head: &str) -> Result<ConnectHead> {
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| Error::malformed("empty CONNECT head"))?;

    let mut words = request_line.split_whitespace();
    let (Some(method), Some(target), Some(protocol)) = (words.next(), words.next(), words.next())
    else {
        return Err(Error::malformed(format!(
            "bad request line '{}'",
            request_line
        )));
    };
    if method != "CONNECT" {
        return Err(Error::malformed(format!("expected CONNECT, got '{}'", method)));
    }
    let version = protocol
        .strip_prefix("HTTP/")
        .unwrap_or("1.1")
        .to_string();
    let (host, port) = parse_connect_target(target)?;

    let mut echo_connection = false;
    let mut echo_proxy_connection = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let keep_alive = value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"));
        if !keep_alive {
            continue;
        }
        if name.trim().eq_ignore_ascii_case("connection") {
            echo_connection = true;
        } else if name.trim().eq_ignore_ascii_case("proxy-connection") {
            echo_proxy_connection = true;
        }
    }

    Ok(ConnectHead {
        host,
        port,
        version,
        echo_connection,
        echo_proxy_connection,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|idx| idx + 4)
}

/// CRLF is mandatory here regardless of host platform; keep-alive
/// headers are echoed back when the client asked for them.
async fn write_established<S>(client: &mut S, head: &ConnectHead) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/{} 200 Connection Established\r\n", head.version);
    if head.echo_connection {
        response.push_str("Connection: keep-alive\r\n");
    }
    if head.echo_proxy_connection {
        response.push_str("Proxy-Connection: keep-alive\r\n");
    }
    response.push_str("\r\n");
    client.write_all(response.as_bytes()).await?;
    client.flush().await
}

/// Drive a CONNECT tunnel. `buf` holds whatever the dispatcher already
/// read from the client.
pub(crate) async fn handle<S>(engine: Arc<Engine>, mut client: S, mut buf: BytesMut) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let head_end = loop {
        if let Some(idx) = find_head_end(&buf) {
            break idx;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::malformed("CONNECT head too large"));
        }
        if client.read_buf(&mut buf).await? == 0 {
            return Err(Error::malformed("connection closed before CONNECT head"));
        }
    };
    let leftover = buf.split_off(head_end);

    let head_text = String::from_utf8_lossy(&buf).into_owned();
    let head = parse_connect_head(&head_text)?;

    let request_id = engine.next_request_id();
    let target = format!("{}:{}", head.host, head.port);
    tracing::debug!(request_id, target = %target, "CONNECT");

    match engine.connect_patcher().on_connect(&target, request_id).await {
        ConnectDecision::Deny => {
            tracing::debug!(request_id, target = %target, "CONNECT denied");
            Ok(())
        }
        ConnectDecision::Pipe => pipe(engine, client, leftover, &head).await,
        ConnectDecision::Allow => intercept(engine, client, leftover, &head).await,
    }
}

/// Raw splice to the origin; the engine sees no further events on this
/// tunnel.
async fn pipe<S>(
    engine: Arc<Engine>,
    mut client: S,
    leftover: BytesMut,
    head: &ConnectHead,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let port = engine.upstream_port(head.port);
    let mut upstream = TcpStream::connect((head.host.as_str(), port))
        .await
        .map_err(|e| Error::upstream(format!("Failed to connect to {}:{}: {}", head.host, port, e)))?;

    write_established(&mut client, head).await?;
    if !leftover.is_empty() {
        upstream.write_all(&leftover).await?;
    }

    match copy_bidirectional(&mut client, &mut upstream).await {
        Ok((from_client, from_origin)) => {
            tracing::debug!(host = %head.host, from_client, from_origin, "Pipe closed");
        }
        Err(e) => {
            tracing::debug!(host = %head.host, error = %e, "Pipe ended with error");
        }
    }
    Ok(())
}

/// Establish the tunnel, sniff the first bytes, and feed TLS into the
/// interception listener. Anything that is not TLS is dropped.
async fn intercept<S>(
    engine: Arc<Engine>,
    mut client: S,
    leftover: BytesMut,
    head: &ConnectHead,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_established(&mut client, head).await?;

    let mut peeked = leftover;
    while peeked.len() < 3 {
        if client.read_buf(&mut peeked).await? == 0 {
            return Err(Error::malformed("tunnel closed before any payload"));
        }
    }
    if !is_tls_client_hello(peeked[0], peeked[1], peeked[2]) {
        return Err(Error::malformed("tunnel payload is not a TLS handshake"));
    }

    engine.sni().prepare(&head.host).await?;

    let port = engine.sni().local_port();
    let mut local = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| Error::tls(format!("Failed to reach the interception listener: {}", e)))?;

    // The listener must see the complete record, peeked bytes first.
    local.write_all(&peeked).await?;

    match copy_bidirectional(&mut client, &mut local).await {
        Ok((from_client, from_listener)) => {
            tracing::debug!(host = %head.host, from_client, from_listener, "Intercepted tunnel closed");
        }
        Err(e) => {
            tracing::debug!(host = %head.host, error = %e, "Intercepted tunnel ended with error");
        }
    }
    Ok(())
}
