//! HTTP/1.1 client wire codec.
//!
//! Serializes outgoing requests and parses response heads with [`httparse`].
//! Body framing (`Content-Length`, chunked, read-until-close) is decided from
//! the parsed head; chunked bodies are decoded here as well.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while decoding an HTTP/1.1 response.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("response is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid chunked transfer encoding")]
    InvalidChunk,
}

/// Largest response (head plus body) a client buffers.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength(usize),
    Chunked,
    /// No length information: the body runs until the peer closes.
    UntilClose,
}

/// A parsed status line plus headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    /// Offset in the buffer at which the body begins.
    pub body_offset: usize,
}

impl ResponseHead {
    /// Maximum number of headers we accept per response.
    const MAX_HEADERS: usize = 64;

    /// Parses a response head from the start of `buf`.
    ///
    /// # Errors
    ///
    /// - [`WireError::Incomplete`]: the header block has not fully arrived.
    /// - [`WireError::Parse`]: the data is not a valid HTTP/1.x response.
    /// - [`WireError::MissingField`]: the status code is absent.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(WireError::Incomplete),
        };

        let status = raw.code.ok_or(WireError::MissingField { field: "status" })?;
        let reason = raw.reason.unwrap_or_default().to_owned();

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        Ok(Self {
            status,
            reason,
            headers: header_map,
            body_offset,
        })
    }

    /// Decides how the body is delimited.
    pub fn framing(&self) -> Framing {
        // 1xx, 204 and 304 never carry a body.
        if (100..200).contains(&self.status) || self.status == 204 || self.status == 304 {
            return Framing::ContentLength(0);
        }
        let chunked = self
            .headers
            .get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return Framing::Chunked;
        }
        match self
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
        {
            Some(len) => Framing::ContentLength(len),
            None => Framing::UntilClose,
        }
    }
}

/// Serializes a request into HTTP/1.1 wire format.
///
/// `target` is the request-target (path plus query). A `Content-Length`
/// header is written whenever there is a body, or the method is not one that
/// carries its data in the query string.
pub fn encode_request(method: &Method, target: &str, headers: &Headers, body: &[u8]) -> BytesMut {
    let estimated_size = 64 + target.len() + headers.len() * 64 + body.len();
    let mut buf = BytesMut::with_capacity(estimated_size);

    buf.put(format!("{method} {target} HTTP/1.1\r\n").as_bytes());

    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }

    if !body.is_empty() || !method.carries_query_data() {
        buf.put(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }

    buf.put(&b"\r\n"[..]);
    buf.put(body);
    buf
}

/// Decodes a complete chunked body from `buf`.
///
/// Returns `Ok(None)` while the terminating chunk (and trailer section) has
/// not yet arrived.
pub fn decode_chunked(buf: &[u8]) -> Result<Option<Bytes>, WireError> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let (consumed, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(WireError::InvalidChunk),
        };
        pos += consumed;
        let size = usize::try_from(size)
            .ok()
            .filter(|&size| size <= MAX_RESPONSE_SIZE)
            .ok_or(WireError::InvalidChunk)?;

        if size == 0 {
            // Optional trailers, closed by an empty line.
            let rest = &buf[pos..];
            let finished =
                rest.starts_with(b"\r\n") || rest.windows(4).any(|w| w == b"\r\n\r\n");
            return Ok(finished.then(|| body.freeze()));
        }

        let data_end = pos.checked_add(size).ok_or(WireError::InvalidChunk)?;
        let chunk_end = data_end.checked_add(2).ok_or(WireError::InvalidChunk)?;
        if buf.len() < chunk_end {
            return Ok(None);
        }
        body.put(&buf[pos..data_end]);
        if &buf[data_end..chunk_end] != b"\r\n" {
            return Err(WireError::InvalidChunk);
        }
        pos = chunk_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_response_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}";
        let head = ResponseHead::parse(raw).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.get("content-type"), Some("application/json"));
        assert_eq!(head.framing(), Framing::ContentLength(7));
        assert_eq!(&raw[head.body_offset..], b"{\"a\":1}");
    }

    #[test]
    fn incomplete_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-";
        assert!(matches!(ResponseHead::parse(raw), Err(WireError::Incomplete)));
    }

    #[test]
    fn framing_rules() {
        let chunked = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(chunked.framing(), Framing::Chunked);

        let close = ResponseHead::parse(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert_eq!(close.framing(), Framing::UntilClose);

        let not_modified =
            ResponseHead::parse(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n").unwrap();
        assert_eq!(not_modified.framing(), Framing::ContentLength(0));
    }

    #[test]
    fn encode_get_without_body() {
        let mut headers = Headers::new();
        headers.insert("Host", "example.com");
        let bytes = encode_request(&Method::Get, "/a?b=1", &headers, b"");
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(text, "GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
    }

    #[test]
    fn encode_post_writes_content_length() {
        let bytes = encode_request(&Method::Post, "/upload", &Headers::new(), b"\x00\x01\x02");
        assert!(bytes.starts_with(b"POST /upload HTTP/1.1\r\nContent-Length: 3\r\n\r\n"));
        assert!(bytes.ends_with(b"\x00\x01\x02"));
    }

    #[test]
    fn chunked_body_decodes() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert_eq!(decode_chunked(raw).unwrap().as_deref(), Some(&b"Wikipedia"[..]));
    }

    #[test]
    fn chunked_body_waits_for_terminator() {
        assert_eq!(decode_chunked(b"4\r\nWiki\r\n").unwrap(), None);
        assert_eq!(decode_chunked(b"4\r\nWi").unwrap(), None);
    }

    #[test]
    fn oversized_chunk_size_is_rejected() {
        assert!(matches!(
            decode_chunked(b"ffffffffffffffff\r\nab\r\n"),
            Err(WireError::InvalidChunk)
        ));
        let just_over = format!("{:x}\r\n", MAX_RESPONSE_SIZE + 1);
        assert!(matches!(
            decode_chunked(just_over.as_bytes()),
            Err(WireError::InvalidChunk)
        ));
    }

    #[test]
    fn chunked_body_rejects_bad_framing() {
        assert!(decode_chunked(b"4\r\nWikiXX0\r\n\r\n").is_err());
    }
}
