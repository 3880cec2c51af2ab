use memchr::memmem;

/// One segment of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Extracts the `boundary=` parameter from a `Content-Type` value.
pub fn boundary(content_type: &str) -> Option<&str> {
    let idx = content_type.find("boundary=")?;
    let rest = &content_type[idx + 9..];
    let rest = rest.split(';').next().unwrap_or(rest).trim();
    let rest = rest.trim_matches('"');
    if rest.is_empty() { None } else { Some(rest) }
}

/// Iterator over the parts of a multipart body.
///
/// Parts are delimited by `CRLF--boundary`; only the opening delimiter may
/// sit at the very start of the body without the CRLF. Parts with
/// unreadable headers or no terminating delimiter end the iteration;
/// whatever was parsed up to that point is kept.
pub struct Multipart<'a> {
    body: &'a [u8],
    delimiter: Vec<u8>,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self { body, delimiter }
    }

    /// Offset just past the next delimiter.
    fn after_delimiter(&self) -> Option<usize> {
        let opening = &self.delimiter[2..];
        if self.body.starts_with(opening) {
            return Some(opening.len());
        }
        memmem::find(self.body, &self.delimiter).map(|pos| pos + self.delimiter.len())
    }
}

impl Iterator for Multipart<'_> {
    type Item = Part;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }

        let Some(mut start) = self.after_delimiter() else {
            self.body = &[];
            return None;
        };

        // `--` after the delimiter closes the body
        if self.body[start..].starts_with(b"--") {
            self.body = &[];
            return None;
        }
        if self.body[start..].starts_with(b"\r\n") {
            start += 2;
        }

        let Some(header_end) = memmem::find(&self.body[start..], b"\r\n\r\n") else {
            self.body = &[];
            return None;
        };
        let header_slice = &self.body[start..start + header_end];
        let body_start = start + header_end + 4;

        let Some(pos) = memmem::find(&self.body[body_start..], &self.delimiter) else {
            self.body = &[];
            return None;
        };
        let body_end = body_start + pos;
        let data = self.body[body_start..body_end].to_vec();
        self.body = &self.body[body_end..];

        let mut part = Part {
            name: None,
            filename: None,
            content_type: None,
            data,
        };

        let headers = String::from_utf8_lossy(header_slice);
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.eq_ignore_ascii_case("content-disposition") {
                part.name = quoted_param(value, "name");
                part.filename = quoted_param(value, "filename");
            } else if key.eq_ignore_ascii_case("content-type") {
                part.content_type = Some(value.trim().to_string());
            }
        }

        Some(part)
    }
}

/// Reads `key="value"` out of a `Content-Disposition` parameter list.
fn quoted_param(disposition: &str, key: &str) -> Option<String> {
    disposition.split(';').map(str::trim).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        if k.trim() == key {
            Some(v.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"description\"\r\n\
\r\n\
sunset over the bay\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"image\"; filename=\"sunset.png\"\r\n\
Content-Type: image/png\r\n\
\r\n\
\x89PNG\r\n\x1a\n\r\n\
--XyZ--\r\n";

    #[test]
    fn test_boundary_extraction() {
        assert_eq!(boundary("multipart/form-data; boundary=XyZ"), Some("XyZ"));
        assert_eq!(
            boundary("multipart/form-data; boundary=\"a b\"; charset=utf-8"),
            Some("a b")
        );
        assert_eq!(boundary("multipart/form-data"), None);
    }

    #[test]
    fn test_multipart_parts() {
        let parts: Vec<Part> = Multipart::new(BODY, "XyZ").collect();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].name.as_deref(), Some("description"));
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].data, b"sunset over the bay");

        assert_eq!(parts[1].name.as_deref(), Some("image"));
        assert_eq!(parts[1].filename.as_deref(), Some("sunset.png"));
        assert_eq!(parts[1].content_type.as_deref(), Some("image/png"));
        assert_eq!(parts[1].data, b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_multipart_truncated_body_stops() {
        let truncated = &BODY[..40];
        assert_eq!(Multipart::new(truncated, "XyZ").count(), 0);
    }

    #[test]
    fn test_boundary_text_inside_a_line_is_data() {
        let body = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
\r\n\
hello--XyZworld and a --XyZ more\r\n\
--XyZ--\r\n";
        let parts: Vec<Part> = Multipart::new(body, "XyZ").collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].data, b"hello--XyZworld and a --XyZ more");
    }

    #[test]
    fn test_preamble_before_first_delimiter() {
        let body = b"ignored preamble\r\n--XyZ\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\
\r\n\
\r\n\
--XyZ--\r\n";
        let parts: Vec<Part> = Multipart::new(body, "XyZ").collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name.as_deref(), Some("note"));
        assert!(parts[0].data.is_empty());
    }
}
