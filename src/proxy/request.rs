//! The request engine: absolute-URI proxy transactions and the
//! transactions decrypted by the interception listener.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_TYPE, HOST, REFERER, TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, Uri, Version};
use std::sync::Arc;

use super::response::{empty_response, full_body, redirect_text_response, ProxyBody};
use crate::body::{decode_body, is_textual};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::patch::{PatchContext, RequestDecision};

/// Outbound destination derived from an absolute URL.
struct Target {
    use_tls: bool,
    host: String,
    port: u16,
    path_and_query: String,
}

impl Target {
    fn from_uri(uri: &Uri) -> Result<Self> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::malformed("request target is not an absolute URL"))?;
        let use_tls = match scheme {
            "http" => false,
            "https" => true,
            other => {
                return Err(Error::malformed(format!("unsupported scheme '{}'", other)));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::malformed("request target has no host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if use_tls { 443 } else { 80 });
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Ok(Self {
            use_tls,
            host,
            port,
            path_and_query,
        })
    }

    fn default_port(&self) -> u16 {
        if self.use_tls {
            443
        } else {
            80
        }
    }

    fn authority(&self) -> String {
        if self.port == self.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.authority(), self.path_and_query)
    }
}

/// Entry point for the forward listener. The target must be an
/// absolute URL; a path-only target means the request was aimed at the
/// proxy itself and the connection is torn down without an answer.
pub async fn handle_forward(
    engine: Arc<Engine>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>> {
    let target = Target::from_uri(req.uri())?;
    handle(engine, req, target).await
}

/// Entry point for connections unwrapped by the interception listener:
/// the absolute URL is synthesised from the tunnel's SNI host.
pub async fn handle_intercepted(
    engine: Arc<Engine>,
    req: Request<Incoming>,
    sni_host: String,
) -> Result<Response<ProxyBody>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let target = Target {
        use_tls: true,
        host: sni_host,
        port: 443,
        path_and_query,
    };
    handle(engine, req, target).await
}

async fn handle(
    engine: Arc<Engine>,
    req: Request<Incoming>,
    target: Target,
) -> Result<Response<ProxyBody>> {
    let request_id = engine.next_request_id();
    let version = req.version();
    let method = req.method().clone();
    let referer = req
        .headers()
        .get(REFERER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let accept = req
        .headers()
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;

    let body = body.collect().await?.to_bytes();
    if !body.is_empty() && (method == Method::GET || method == Method::HEAD) {
        tracing::warn!(method = %method, url = %target.url(), "Request method does not usually carry a body");
    }

    let ctx = PatchContext {
        request_id,
        referer,
        url: target.url(),
        method: method.clone(),
        version,
    };
    tracing::debug!(request_id, method = %method, url = %ctx.url, "Request");

    let (decision, body) = engine
        .request_patcher()
        .on_request(&ctx, &mut headers, body)
        .await;

    match decision {
        RequestDecision::Allow => {
            forward(engine, &ctx, method, version, headers, body, target).await
        }
        RequestDecision::Empty { headers: overrides } => {
            tracing::debug!(request_id, "Patcher answered with an empty page");
            Ok(empty_response(accept.as_deref(), overrides))
        }
        RequestDecision::Deny => {
            tracing::debug!(request_id, url = %ctx.url, "Patcher denied the request");
            Err(Error::Denied)
        }
        RequestDecision::Redirect {
            location: None,
            text,
            headers: overrides,
        } => {
            tracing::debug!(request_id, "Patcher substituted the response body");
            Ok(redirect_text_response(
                text.unwrap_or_default(),
                accept.as_deref(),
                overrides,
            ))
        }
        RequestDecision::Redirect {
            location: Some(location),
            ..
        } => {
            tracing::debug!(request_id, location = %location, "Patcher re-targeted the request");
            let uri: Uri = location.parse().map_err(|e| {
                Error::malformed(format!("bad redirect target '{}': {}", location, e))
            })?;
            let target = Target::from_uri(&uri)?;
            // The response patchers must see the URL actually fetched.
            let ctx = PatchContext {
                url: target.url(),
                ..ctx
            };
            forward(engine, &ctx, method, version, headers, body, target).await
        }
    }
}

async fn forward(
    engine: Arc<Engine>,
    ctx: &PatchContext,
    method: Method,
    version: Version,
    mut headers: HeaderMap,
    body: Bytes,
    target: Target,
) -> Result<Response<ProxyBody>> {
    // Force a decompression path the engine knows how to undo.
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
    headers.remove("proxy-connection");

    let authority = target.authority();
    headers.insert(
        HOST,
        HeaderValue::from_str(&authority)
            .map_err(|_| Error::malformed(format!("bad authority '{}'", authority)))?,
    );

    let agent = engine.agents().get(version, &headers, target.use_tls);
    headers.insert(
        CONNECTION,
        HeaderValue::from_static(if agent.keep_alive() { "keep-alive" } else { "close" }),
    );

    let mut out_req = Request::builder()
        .method(method)
        .uri(target.path_and_query.as_str())
        .body(Full::new(body))
        .map_err(|e| Error::malformed(format!("unusable outbound request: {}", e)))?;
    *out_req.headers_mut() = headers;

    let tls = target.use_tls.then(|| engine.upstream_tls());
    let port = engine.upstream_port(target.port);
    let resp = match agent.request(tls, &target.host, port, out_req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(url = %ctx.url, error = %e, "Upstream request failed");
            return Err(e);
        }
    };

    let (mut parts, resp_body) = resp.into_parts();

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let final_body = if is_textual(&content_type) {
        let encoding = parts
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let decoded = match decode_body(encoding.as_deref(), &resp_body) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(url = %ctx.url, error = %e, "Failed to decode upstream body");
                return Err(e);
            }
        };
        parts
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));

        let text = String::from_utf8_lossy(&decoded).into_owned();
        let patched = engine
            .text_patcher()
            .on_text_response(ctx, &mut parts.headers, text)
            .await;
        Bytes::from(patched)
    } else {
        engine
            .binary_patcher()
            .on_other_response(ctx, &mut parts.headers, resp_body)
            .await
    };

    // Pinned keys would defeat interception after the pin is stored.
    parts.headers.remove("public-key-pins");
    // The body is re-emitted whole; connection management is the
    // listener's business, not the origin's.
    parts.headers.remove(TRANSFER_ENCODING);
    parts.headers.remove(CONNECTION);
    parts.headers.remove("keep-alive");
    parts.headers.insert(CONTENT_LENGTH, final_body.len().into());

    Ok(Response::from_parts(parts, full_body(final_body)))
}
