//! Synthesised responses for patcher decisions

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, SERVER};
use hyper::{Response, StatusCode};

use crate::body::extract_mime;

/// `Server` value presented on synthesised responses, chosen to blend
/// in rather than advertise the proxy.
pub const DEFAULT_SERVER: &str = "Apache/2.4.7 (Ubuntu)";

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|e| match e {}).boxed()
}

/// Synthesise the 200 response for an `Empty` decision: empty body,
/// `Content-Type` derived from the request's `Accept` header, and a
/// camouflage `Server` header, all overridable by the patcher.
pub fn empty_response(accept: Option<&str>, overrides: Option<HeaderMap>) -> Response<ProxyBody> {
    let mut headers = HeaderMap::new();
    headers.insert(SERVER, DEFAULT_SERVER.parse().unwrap());
    build_synthesised(Bytes::new(), accept, headers, overrides)
}

/// Synthesise the 200 response for a `Redirect` decision carrying
/// replacement text instead of a location.
pub fn redirect_text_response(
    text: Bytes,
    accept: Option<&str>,
    overrides: Option<HeaderMap>,
) -> Response<ProxyBody> {
    build_synthesised(text, accept, HeaderMap::new(), overrides)
}

fn build_synthesised(
    body: Bytes,
    accept: Option<&str>,
    mut headers: HeaderMap,
    overrides: Option<HeaderMap>,
) -> Response<ProxyBody> {
    let mime = extract_mime(accept.unwrap_or(""));
    headers.insert(
        CONTENT_TYPE,
        mime.parse().unwrap_or_else(|_| "text/html".parse().unwrap()),
    );

    if let Some(overrides) = overrides {
        for (name, value) in overrides.iter() {
            headers.insert(name, value.clone());
        }
    }

    // The length always reflects the bytes actually written.
    headers.insert(CONTENT_LENGTH, body.len().into());

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(full_body(body))
        .unwrap();
    *response.headers_mut() = headers;
    response
}
