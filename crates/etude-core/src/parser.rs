// src/parser.rs
use memchr::memmem;

use crate::error::ParseError;
use crate::http::{Method, Request};
use crate::multipart::{self, Multipart};

/// Longest request line or single header line accepted before giving up.
pub const MAX_LINE_LEN: usize = 8 * 1024;
/// Upper bound for the whole header section.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    Ready,
    Error(ParseError),
}

/// Incremental HTTP/1.1 request parser.
///
/// Bytes are accumulated in an internal buffer and consumed as the state
/// machine advances, so a request may arrive split at any byte boundary.
/// Bytes received after a finished request are kept for the next one and
/// picked up after [`reset`](RequestParser::reset).
pub struct RequestParser {
    buf: Vec<u8>,
    pos: usize,
    state: ParseState,
    error: Option<ParseError>,
    body_len: usize,
    header_bytes: usize,
    body_limit: usize,
    request: Request,
}

impl RequestParser {
    pub fn new(body_limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            pos: 0,
            state: ParseState::RequestLine,
            error: None,
            body_len: 0,
            header_bytes: 0,
            body_limit,
            request: Request::default(),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Feeds bytes and advances as far as the buffered input allows.
    pub fn append(&mut self, bytes: &[u8]) -> Progress {
        self.buf.extend_from_slice(bytes);
        if let Some(err) = self.error {
            return Progress::Error(err);
        }
        match self.advance() {
            Ok(()) if self.state == ParseState::Finish => Progress::Ready,
            Ok(()) => Progress::NeedMore,
            Err(err) => {
                self.error = Some(err);
                Progress::Error(err)
            }
        }
    }

    /// Re-runs the state machine over already buffered bytes.
    pub fn poll(&mut self) -> Progress {
        self.append(&[])
    }

    /// Whether unconsumed bytes are waiting in the buffer.
    pub fn has_buffered(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn request(&self) -> Option<&Request> {
        (self.state == ParseState::Finish).then_some(&self.request)
    }

    /// Moves the finished request out. Call [`reset`](Self::reset) before
    /// parsing the next one.
    pub fn take_request(&mut self) -> Option<Request> {
        if self.state != ParseState::Finish {
            return None;
        }
        Some(std::mem::take(&mut self.request))
    }

    /// Prepares for the next request on the same connection, keeping any
    /// bytes that arrived after the previous one.
    pub fn reset(&mut self) {
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.state = ParseState::RequestLine;
        self.error = None;
        self.body_len = 0;
        self.header_bytes = 0;
        self.request = Request::default();
    }

    fn advance(&mut self) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(line) = self.next_line(ParseError::MalformedRequestLine)? else {
                        return Ok(());
                    };
                    self.parse_request_line(&line)?;
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = self.next_line(ParseError::MalformedHeader)? else {
                        return Ok(());
                    };
                    self.header_bytes += line.len() + 2;
                    if self.header_bytes > MAX_HEADER_BYTES {
                        return Err(ParseError::MalformedHeader);
                    }
                    if line.is_empty() {
                        self.begin_body()?;
                        self.state = ParseState::Body;
                    } else {
                        self.parse_header(&line)?;
                    }
                }
                ParseState::Body => {
                    if self.buf.len() - self.pos < self.body_len {
                        return Ok(());
                    }
                    let end = self.pos + self.body_len;
                    self.request.body = self.buf[self.pos..end].to_vec();
                    self.pos = end;
                    self.split_multipart();
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => return Ok(()),
            }
        }
    }

    /// Pops one CRLF-terminated line off the buffer.
    fn next_line(&mut self, too_long: ParseError) -> Result<Option<String>, ParseError> {
        let pending = &self.buf[self.pos..];
        let Some(end) = memmem::find(pending, b"\r\n") else {
            if pending.len() > MAX_LINE_LEN {
                return Err(too_long);
            }
            return Ok(None);
        };
        if end > MAX_LINE_LEN {
            return Err(too_long);
        }
        let line = std::str::from_utf8(&pending[..end])
            .map_err(|_| too_long)?
            .to_string();
        self.pos += end + 2;
        Ok(Some(line))
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut tokens = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(ParseError::MalformedRequestLine);
        };
        if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
            return Err(ParseError::MalformedRequestLine);
        }

        self.request.method = Method::from_bytes(method.as_bytes());
        match target.split_once('?') {
            Some((path, query)) => {
                self.request.path = path.to_string();
                self.request.query = query.to_string();
            }
            None => self.request.path = target.to_string(),
        }
        self.request.version = version.to_string();
        Ok(())
    }

    fn parse_header(&mut self, line: &str) -> Result<(), ParseError> {
        let (name, value) = line.split_once(": ").ok_or(ParseError::MalformedHeader)?;
        if name.is_empty() || name.contains(' ') {
            return Err(ParseError::MalformedHeader);
        }
        // at most one Content-Length, in any spelling
        if name.eq_ignore_ascii_case("Content-Length")
            && self.request.header_ignore_case("Content-Length").is_some()
        {
            return Err(ParseError::MalformedHeader);
        }
        self.request.headers.insert(name, value);
        Ok(())
    }

    /// Decides how many body bytes to wait for once the headers are done.
    fn begin_body(&mut self) -> Result<(), ParseError> {
        if self
            .request
            .header_ignore_case("Transfer-Encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
        {
            return Err(ParseError::UnsupportedTransferEncoding);
        }

        let declared = match self.request.header_ignore_case("Content-Length") {
            Some(_) => Some(
                self.request
                    .content_length()
                    .ok_or(ParseError::MalformedHeader)?,
            ),
            None => None,
        };

        self.body_len = match declared {
            None => 0,
            Some(len) if len > self.body_limit => return Err(ParseError::BodyTooLarge),
            Some(len) => len,
        };
        Ok(())
    }

    fn split_multipart(&mut self) {
        let Some(ct) = self.request.header_ignore_case("Content-Type") else {
            return;
        };
        if !ct.starts_with("multipart/form-data") {
            return;
        }
        let Some(boundary) = multipart::boundary(ct).map(str::to_string) else {
            return;
        };
        self.request.parts = Multipart::new(&self.request.body, &boundary).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    fn parse_all(raw: &[u8]) -> (Progress, RequestParser) {
        let mut parser = RequestParser::new(LIMIT);
        let progress = parser.append(raw);
        (progress, parser)
    }

    #[test]
    fn test_parse_basic_request() {
        let raw = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nKeep-Alive: true\r\n\r\n";
        let (progress, mut parser) = parse_all(raw);
        assert_eq!(progress, Progress::Ready);

        let req = parser.take_request().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/some/path");
        assert_eq!(req.query, "foo=bar");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.header("Host"), Some("localhost"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_parse_incomplete_request() {
        let (progress, parser) = parse_all(b"GET /some/path?foo=bar HTT");
        assert_eq!(progress, Progress::NeedMore);
        assert_eq!(parser.state(), ParseState::RequestLine);
        assert!(parser.request().is_none());
    }

    #[test]
    fn test_body_waits_for_content_length() {
        let mut parser = RequestParser::new(LIMIT);
        let head = b"POST /login HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 30\r\n\r\n";
        assert_eq!(parser.append(head), Progress::NeedMore);
        assert_eq!(parser.state(), ParseState::Body);
        assert_eq!(parser.append(b"username=alice&"), Progress::NeedMore);
        assert_eq!(parser.append(b"password=s3cret"), Progress::Ready);

        let form = parser.request().unwrap().parse_form_body();
        assert_eq!(form["username"], "alice");
        assert_eq!(form["password"], "s3cret");
    }

    #[test]
    fn test_incremental_split_is_identical() {
        let body: &[u8] = b"--b0\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\nhello\r\n--b0--\r\n";
        let mut raw = format!(
            "POST /upload?x=1 HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=b0\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        let raw = raw.as_slice();

        let (progress, mut whole) = parse_all(raw);
        assert_eq!(progress, Progress::Ready);
        let expected = whole.take_request().unwrap();
        assert_eq!(expected.parts.len(), 1);

        for split in 0..=raw.len() {
            let mut parser = RequestParser::new(LIMIT);
            let first = parser.append(&raw[..split]);
            if split < raw.len() {
                assert_eq!(first, Progress::NeedMore, "split at {split}");
            }
            assert_eq!(parser.append(&raw[split..]), Progress::Ready, "split at {split}");
            assert_eq!(parser.take_request().unwrap(), expected, "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut parser = RequestParser::new(LIMIT);
        for (i, b) in raw.iter().enumerate() {
            let progress = parser.append(std::slice::from_ref(b));
            if i + 1 < raw.len() {
                assert_eq!(progress, Progress::NeedMore);
            } else {
                assert_eq!(progress, Progress::Ready);
            }
        }
    }

    #[test]
    fn test_duplicate_headers_overwrite() {
        let (_, parser) = parse_all(b"GET / HTTP/1.1\r\nX-A: 1\r\nX-A: 2\r\n\r\n");
        let req = parser.request().unwrap();
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("X-A"), Some("2"));
    }

    #[test]
    fn test_malformed_request_line() {
        let (progress, _) = parse_all(b"GET /\r\n\r\n");
        assert_eq!(progress, Progress::Error(ParseError::MalformedRequestLine));

        let (progress, _) = parse_all(b"GET / FTP/1.0\r\n\r\n");
        assert_eq!(progress, Progress::Error(ParseError::MalformedRequestLine));

        let (progress, _) = parse_all(b"GET  / HTTP/1.1\r\n\r\n");
        assert_eq!(progress, Progress::Error(ParseError::MalformedRequestLine));
    }

    #[test]
    fn test_malformed_header() {
        let (progress, mut parser) = parse_all(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n");
        assert_eq!(progress, Progress::Error(ParseError::MalformedHeader));
        // errors are sticky
        assert_eq!(parser.append(b"more"), Progress::Error(ParseError::MalformedHeader));

        let (progress, _) = parse_all(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(progress, Progress::Error(ParseError::MalformedHeader));
    }

    #[test]
    fn test_content_length_must_be_digits() {
        for value in ["+5", "-5", "5 5", "0x5"] {
            let raw = format!("POST / HTTP/1.1\r\nContent-Length: {value}\r\n\r\nhello");
            let (progress, _) = parse_all(raw.as_bytes());
            assert_eq!(progress, Progress::Error(ParseError::MalformedHeader), "{value:?}");
        }
    }

    #[test]
    fn test_repeated_content_length_rejected() {
        let (progress, _) =
            parse_all(b"POST / HTTP/1.1\r\ncontent-length: 5\r\nContent-Length: 3\r\n\r\nhello");
        assert_eq!(progress, Progress::Error(ParseError::MalformedHeader));

        let (progress, _) =
            parse_all(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(progress, Progress::Error(ParseError::MalformedHeader));
    }

    #[test]
    fn test_overlong_line_rejected() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_LINE_LEN + 1));
        let (progress, _) = parse_all(&raw);
        assert_eq!(progress, Progress::Error(ParseError::MalformedRequestLine));
    }

    #[test]
    fn test_body_too_large() {
        let mut parser = RequestParser::new(16);
        let progress = parser.append(b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n");
        assert_eq!(progress, Progress::Error(ParseError::BodyTooLarge));
    }

    #[test]
    fn test_chunked_rejected() {
        let (progress, _) =
            parse_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(
            progress,
            Progress::Error(ParseError::UnsupportedTransferEncoding)
        );
    }

    #[test]
    fn test_get_without_length_finishes_at_headers() {
        let (progress, parser) = parse_all(b"DELETE /item HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(progress, Progress::Ready);
        assert_eq!(parser.request().unwrap().method, Method::Delete);
    }

    #[test]
    fn test_reset_keeps_following_request() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let (progress, mut parser) = parse_all(raw);
        assert_eq!(progress, Progress::Ready);
        assert_eq!(parser.take_request().unwrap().path, "/a");
        assert!(parser.has_buffered());

        parser.reset();
        assert_eq!(parser.poll(), Progress::Ready);
        assert_eq!(parser.take_request().unwrap().path, "/b");
        parser.reset();
        assert!(!parser.has_buffered());
        assert_eq!(parser.poll(), Progress::NeedMore);
    }

    #[test]
    fn test_finished_request_is_not_mutated() {
        let (_, mut parser) = parse_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        let before = parser.request().unwrap().clone();
        assert_eq!(parser.append(b"X-Late: 1\r\n\r\n"), Progress::Ready);
        assert_eq!(parser.request().unwrap(), &before);
    }

    #[test]
    fn test_header_parse_serialize_parse() {
        let (_, parser) = parse_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nAccept: */*\r\nX-Trace: a: b\r\n\r\n",
        );
        let headers = parser.request().unwrap().headers.clone();

        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        headers.write_to(&mut raw);
        raw.extend_from_slice(b"\r\n");
        let (_, reparsed) = parse_all(&raw);
        assert_eq!(reparsed.request().unwrap().headers, headers);
        assert_eq!(headers.get("X-Trace"), Some("a: b"));
    }
}
