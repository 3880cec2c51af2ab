// src/writer.rs
use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::http::{Response, reason_phrase};

/// Bodies at or below this size are sent uncompressed.
pub const GZIP_MIN_BODY: usize = 1024;

/// Serializes `response` into `out` in a single pass.
///
/// The body is gzip-compressed when the client accepts it and it is larger
/// than [`GZIP_MIN_BODY`]. `Content-Length` is always recomputed from the
/// bytes actually sent and `Connection` reflects `keep_alive`. The output
/// depends only on the arguments.
pub fn write_response(out: &mut Vec<u8>, mut response: Response, keep_alive: bool, accepts_gzip: bool) {
    if accepts_gzip && response.body.len() > GZIP_MIN_BODY {
        if let Some(compressed) = gzip(&response.body) {
            response.body = compressed;
            response.headers.remove_ignore_case("Content-Encoding");
            response.headers.insert("Content-Encoding", "gzip");
        }
    }
    let headers = &mut response.headers;
    headers.remove_ignore_case("Content-Length");
    headers.remove_ignore_case("Connection");
    headers.insert("Content-Length", response.body.len().to_string());
    headers.insert(
        "Connection",
        if keep_alive { "keep-alive" } else { "close" },
    );

    out.reserve(128 + response.body.len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(response.status.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason_phrase(response.status).as_bytes());
    out.extend_from_slice(b"\r\n");
    response.headers.write_to(out);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
}

/// Convenience wrapper returning a fresh buffer.
pub fn encode(response: Response, keep_alive: bool, accepts_gzip: bool) -> Vec<u8> {
    let mut out = Vec::new();
    write_response(&mut out, response, keep_alive, accepts_gzip);
    out
}

fn gzip(body: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body).ok()?;
    encoder.finish().ok()
}
