//! Traffic patching interfaces
//!
//! The engine consults four externally-replaceable patchers: one per
//! request, one per CONNECT tunnel, one per textual response, and one
//! per binary response. Patchers return decisions from a closed set;
//! decision variants that make no sense for a context are
//! unrepresentable by construction.

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Version};

/// Per-transaction context handed to patchers.
///
/// `request_id` is unique per process and monotonically increasing; a
/// CONNECT tunnel and the requests later decrypted out of it carry
/// distinct ids.
#[derive(Debug, Clone)]
pub struct PatchContext {
    pub request_id: u64,
    pub referer: Option<String>,
    pub url: String,
    pub method: Method,
    pub version: Version,
}

/// Outcome of the request patcher.
#[derive(Debug, Clone)]
pub enum RequestDecision {
    /// Forward the request upstream unchanged.
    Allow,
    /// Respond 200 with an empty body. `Content-Type` defaults to one
    /// derived from the request's `Accept` header.
    Empty { headers: Option<HeaderMap> },
    /// Close the client connection without a response.
    Deny,
    /// Serve different content without the user agent seeing an HTTP
    /// redirect: with a `location`, the request is re-targeted and
    /// forwarded there; without one, `text` is served as a 200 body.
    Redirect {
        location: Option<String>,
        text: Option<Bytes>,
        headers: Option<HeaderMap>,
    },
}

/// Outcome of the CONNECT patcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Establish the tunnel and intercept it.
    Allow,
    /// Close the client connection without a response.
    Deny,
    /// Splice a raw TCP pipe to the origin with no further inspection.
    Pipe,
}

/// Inspects and optionally rewrites outbound requests.
#[async_trait]
pub trait RequestPatcher: Send + Sync {
    /// Header mutations made through `headers` are reflected upstream,
    /// subject to the engine's own overrides. The returned bytes
    /// replace the request body.
    async fn on_request(
        &self,
        ctx: &PatchContext,
        headers: &mut HeaderMap,
        body: Bytes,
    ) -> (RequestDecision, Bytes);
}

/// Decides the fate of CONNECT tunnels.
#[async_trait]
pub trait ConnectPatcher: Send + Sync {
    async fn on_connect(&self, target: &str, request_id: u64) -> ConnectDecision;
}

/// Rewrites decoded textual response bodies.
#[async_trait]
pub trait TextPatcher: Send + Sync {
    async fn on_text_response(
        &self,
        ctx: &PatchContext,
        headers: &mut HeaderMap,
        text: String,
    ) -> String;
}

/// Rewrites non-textual response bodies. The bytes are handed over
/// still carrying whatever `Content-Encoding` the origin used.
#[async_trait]
pub trait BinaryPatcher: Send + Sync {
    async fn on_other_response(
        &self,
        ctx: &PatchContext,
        headers: &mut HeaderMap,
        body: Bytes,
    ) -> Bytes;
}

/// The built-in patcher: allows everything and injects a greeting
/// script into HTML heads, which doubles as a quick visual check that
/// interception is working.
pub struct DefaultPatcher;

/// Script tag the default text patcher splices in after `<head>`.
pub const HELLO_SCRIPT: &str =
    r#"<script>console.log("Hello from Violentproxy :)");</script>"#;

/// Insert [`HELLO_SCRIPT`] after the first `<head>` tag, if any.
pub fn inject_hello_script(text: &str) -> String {
    match text.find("<head>") {
        Some(idx) => {
            let split = idx + "<head>".len();
            let mut out = String::with_capacity(text.len() + HELLO_SCRIPT.len());
            out.push_str(&text[..split]);
            out.push_str(HELLO_SCRIPT);
            out.push_str(&text[split..]);
            out
        }
        None => text.to_string(),
    }
}

#[async_trait]
impl RequestPatcher for DefaultPatcher {
    async fn on_request(
        &self,
        _ctx: &PatchContext,
        _headers: &mut HeaderMap,
        body: Bytes,
    ) -> (RequestDecision, Bytes) {
        (RequestDecision::Allow, body)
    }
}

#[async_trait]
impl ConnectPatcher for DefaultPatcher {
    async fn on_connect(&self, _target: &str, _request_id: u64) -> ConnectDecision {
        ConnectDecision::Allow
    }
}

#[async_trait]
impl TextPatcher for DefaultPatcher {
    async fn on_text_response(
        &self,
        _ctx: &PatchContext,
        _headers: &mut HeaderMap,
        text: String,
    ) -> String {
        inject_hello_script(&text)
    }
}

#[async_trait]
impl BinaryPatcher for DefaultPatcher {
    async fn on_other_response(
        &self,
        _ctx: &PatchContext,
        _headers: &mut HeaderMap,
        body: Bytes,
    ) -> Bytes {
        body
    }
}
