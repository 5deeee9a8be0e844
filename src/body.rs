//! Response body decoding and content-type helpers

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use std::io::Read;

use crate::error::{Error, Result};

/// Decode a response body according to its `Content-Encoding`.
///
/// Only `gzip` and `deflate` can appear upstream because the engine
/// forces `Accept-Encoding: gzip, deflate` on every outbound request;
/// anything else is treated as identity.
pub fn decode_body(encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>> {
    let encoding = encoding.map(str::trim).map(str::to_ascii_lowercase);
    match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => {
            let mut decoder = MultiGzDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::decode(format!("gzip decode failed: {}", e)))?;
            Ok(out)
        }
        Some("deflate") => {
            let mut decoder = ZlibDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::decode(format!("deflate decode failed: {}", e)))?;
            Ok(out)
        }
        _ => Ok(body.to_vec()),
    }
}

/// Whether a `Content-Type` value names a textual payload that the text
/// patcher should see: `text/*`, `*/xml`, or `*/xhtml+xml`.
pub fn is_textual(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let mut parts = mime.splitn(2, '/');
    let kind = parts.next().unwrap_or("");
    let subtype = parts.next().unwrap_or("");
    kind == "text" || subtype == "xml" || subtype == "xhtml+xml"
}

/// Extract a concrete MIME type from a comma-or-semicolon-separated
/// header value such as `Accept`.
///
/// Returns the first component that contains a `/` and no `*`,
/// defaulting to `text/html`. Used for the `Content-Type` of
/// synthesised responses.
pub fn extract_mime(value: &str) -> String {
    value
        .split([',', ';'])
        .map(str::trim)
        .find(|part| part.contains('/') && !part.contains('*'))
        .unwrap_or("text/html")
        .to_string()
}
