// src/http.rs
use std::collections::HashMap;
use std::fmt;

use crate::multipart::Part;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"HEAD" => Method::Head,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"TRACE" => Method::Trace,
            b"OPTIONS" => Method::Options,
            b"CONNECT" => Method::Connect,
            b"PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header map. Names are case-sensitive and hold a single value;
/// inserting an existing name overwrites the value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_ignore_case(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(idx).1)
    }

    /// Drops every entry whose name matches `name` in any letter case.
    pub fn remove_ignore_case(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes every header as `Name: Value\r\n`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (k, v) in &self.entries {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// A fully parsed HTTP request. Built by [`crate::parser::RequestParser`]
/// and never mutated after the parser reports it ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    /// Text after the first `?`, without the `?`. Empty when absent.
    pub query: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Multipart segments, populated only for `multipart/form-data` bodies.
    pub parts: Vec<Part>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Unknown,
            path: String::new(),
            query: String::new(),
            version: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
            parts: Vec::new(),
        }
    }
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn header_ignore_case(&self, name: &str) -> Option<&str> {
        self.headers.get_ignore_case(name)
    }

    /// Declared body length. `None` when absent or not a plain run of
    /// ASCII digits.
    pub fn content_length(&self) -> Option<usize> {
        let raw = self.header_ignore_case("Content-Length")?.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        raw.parse().ok()
    }

    /// Whether the connection may be reused after this request.
    ///
    /// An explicit `Connection: close` always wins; `Connection: keep-alive`
    /// opts in; otherwise HTTP/1.1 defaults to persistent and older versions
    /// to close.
    pub fn keep_alive(&self) -> bool {
        if let Some(conn) = self.header_ignore_case("Connection") {
            let mut keep = false;
            for token in conn.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    return false;
                }
                if token.eq_ignore_ascii_case("keep-alive") {
                    keep = true;
                }
            }
            if keep {
                return true;
            }
        }
        self.version == "HTTP/1.1"
    }

    pub fn accepts_gzip(&self) -> bool {
        self.header_ignore_case("Accept-Encoding")
            .is_some_and(|v| v.contains("gzip"))
    }

    /// Decodes an `application/x-www-form-urlencoded` body: pairs split on
    /// `&`, then at the first `=`, with percent-decoding and `+` as space.
    /// Later duplicates overwrite earlier ones.
    pub fn parse_form_body(&self) -> HashMap<String, String> {
        match self.header_ignore_case("Content-Type") {
            Some(ct) if !ct.starts_with("application/x-www-form-urlencoded") => HashMap::new(),
            _ => decode_form(&self.body),
        }
    }

    /// Decodes the query string with the same rules as the form body.
    pub fn parse_query(&self) -> HashMap<String, String> {
        decode_form(self.query.as_bytes())
    }

    /// Text field of a multipart body.
    pub fn form_field(&self, name: &str) -> Option<&str> {
        self.parts
            .iter()
            .find(|p| p.filename.is_none() && p.name.as_deref() == Some(name))
            .and_then(|p| std::str::from_utf8(&p.data).ok())
    }

    /// File part of a multipart body.
    pub fn file(&self, name: &str) -> Option<&Part> {
        self.parts
            .iter()
            .find(|p| p.filename.is_some() && p.name.as_deref() == Some(name))
    }
}

fn decode_form(raw: &[u8]) -> HashMap<String, String> {
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(raw)
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

/// Reason phrase for the status line. Codes outside the table render as
/// `Unknown`.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200)
            .with_header("Content-Type", "text/plain")
            .with_body(body)
    }

    pub fn error(status: u16, message: impl Into<Vec<u8>>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain")
            .with_body(message)
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200)
            .with_header("Content-Type", "text/html")
            .with_body(body)
    }

    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200)
            .with_header("Content-Type", "application/json")
            .with_body(body)
    }

    pub fn not_found() -> Self {
        Self::error(404, "Not Found")
    }

    pub fn internal_error() -> Self {
        Self::error(500, "Internal Server Error")
    }

    pub fn bad_request() -> Self {
        Self::error(400, "Bad Request")
    }

    pub fn service_unavailable() -> Self {
        Self::error(503, "Service Unavailable")
    }
}
