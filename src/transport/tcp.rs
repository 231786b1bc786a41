//! Plain HTTP/1.1 exchange over a tokio `TcpStream`.
//!
//! One connection per request (`Connection: close`). The response head is
//! parsed with `httparse`; the body is framed by `Content-Length`, chunked
//! transfer coding, or connection close.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::Url;

use super::{Exchange, RawReply, RawRequest, TransportError};
use crate::http::{Method, StatusCode};
use crate::http::wire::{
    Framing, MAX_RESPONSE_SIZE, ResponseHead, WireError, decode_chunked, encode_request,
};

/// Initial read buffer size.
const INITIAL_BUF_SIZE: usize = 8 * 1024;

/// [`Exchange`] speaking HTTP/1.1 over TCP.
///
/// Relative request URLs (`/api/x`) are resolved against the base URL, if one
/// was configured.
#[derive(Debug, Clone, Default)]
pub struct TcpExchange {
    base: Option<Url>,
}

impl TcpExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves relative request URLs against `base`.
    pub fn with_base(base: Url) -> Self {
        Self { base: Some(base) }
    }

    fn resolve(&self, raw: &str) -> Result<Url, TransportError> {
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: raw.to_owned(),
            reason,
        };

        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base {
                Some(base) => base.join(raw).map_err(|e| invalid(e.to_string()))?,
                None => return Err(invalid("relative URL and no base configured".to_owned())),
            },
            Err(e) => return Err(invalid(e.to_string())),
        };

        if url.scheme() != "http" {
            return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_owned()));
        }
        Ok(url)
    }
}

#[async_trait]
impl Exchange for TcpExchange {
    async fn exchange(&self, request: RawRequest) -> Result<RawReply, TransportError> {
        let url = self.resolve(&request.url)?;
        // Checked in `resolve`.
        let host = url.host_str().unwrap_or_default();
        let port = url.port_or_known_default().unwrap_or(80);

        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        let mut headers = request.headers;
        if !headers.contains("host") {
            let authority = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_owned(),
            };
            headers.insert("Host", authority);
        }
        headers.set("Connection", "close");

        debug!(method = %request.method, %url, "sending request");
        let mut stream = TcpStream::connect((host, port)).await?;
        let wire = encode_request(&request.method, &target, &headers, &request.body);
        stream.write_all(&wire).await?;
        stream.flush().await?;

        let reply = read_response(&mut stream, request.method == Method::Head).await?;
        debug!(status = reply.status, bytes = reply.body.len(), "response received");
        Ok(reply)
    }
}

/// Reads one complete response from `stream`.
async fn read_response(stream: &mut TcpStream, head_only: bool) -> Result<RawReply, TransportError> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut eof = false;

    let head = loop {
        match ResponseHead::parse(&buf) {
            Ok(head) => break head,
            Err(WireError::Incomplete) if !eof => {}
            Err(WireError::Incomplete) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before response head",
                )));
            }
            Err(e) => return Err(e.into()),
        }
        eof = fill(stream, &mut buf).await?;
    };

    let framing = if head_only {
        Framing::ContentLength(0)
    } else {
        head.framing()
    };
    trace!(status = head.status, ?framing, "parsed response head");

    let body = loop {
        let received = &buf[head.body_offset..];
        match framing {
            Framing::ContentLength(len) => {
                if len > MAX_RESPONSE_SIZE {
                    return Err(TransportError::ResponseTooLarge {
                        max_bytes: MAX_RESPONSE_SIZE,
                    });
                }
                if received.len() >= len {
                    break Bytes::copy_from_slice(&received[..len]);
                }
                if eof {
                    return Err(truncated());
                }
            }
            Framing::Chunked => {
                if let Some(body) = decode_chunked(received)? {
                    break body;
                }
                if eof {
                    return Err(truncated());
                }
            }
            Framing::UntilClose => {
                if eof {
                    break Bytes::copy_from_slice(received);
                }
            }
        }
        eof = fill(stream, &mut buf).await?;
    };

    // HTTP/1.1 allows an empty reason phrase.
    let status_text = match StatusCode::from_u16(head.status) {
        Some(known) if head.reason.is_empty() => known.canonical_reason().to_owned(),
        _ => head.reason,
    };

    Ok(RawReply {
        status: head.status,
        status_text,
        headers: head.headers,
        body,
    })
}

/// Reads more data into `buf`. Returns `true` once the peer has closed.
async fn fill(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<bool, TransportError> {
    let read = stream.read_buf(buf).await?;
    if buf.len() > MAX_RESPONSE_SIZE {
        return Err(TransportError::ResponseTooLarge {
            max_bytes: MAX_RESPONSE_SIZE,
        });
    }
    Ok(read == 0)
}

fn truncated() -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before response body was complete",
    ))
}
