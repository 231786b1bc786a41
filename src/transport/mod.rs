//! Request transports.
//!
//! A [`Transport`] turns a [`RequestDescriptor`] into a completed [`Response`].
//! It sits on top of an [`Exchange`], the raw network round trip: bytes out,
//! status, headers and bytes back. [`TcpExchange`] is the default exchange.
//!
//! Two transports are provided:
//!
//! - [`DefaultTransport`]: serializes request data (forms, JSON, text) and
//!   decodes the response as text or JSON.
//! - [`BinaryTransportAdapter`]: intercepts binary requests and responses and
//!   carries them byte-for-byte, delegating everything else.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::strip_busting_token;
use crate::clock::{Clock, SystemClock};
use crate::http::wire::WireError;
use crate::http::{
    Headers, Method, Payload, RequestBody, RequestDescriptor, Response, ResponseType,
    is_success_status,
};

mod binary;
mod tcp;

pub use binary::BinaryTransportAdapter;
pub use tcp::TcpExchange;

/// Errors produced while sending a request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("malformed response: {0}")]
    Wire(#[from] WireError),

    #[error("response exceeds maximum allowed size of {max_bytes} bytes")]
    ResponseTooLarge { max_bytes: usize },

    #[error("cannot serialize request body: {0}")]
    Serialization(String),

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A request ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// What came back from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReply {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// One raw network round trip.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, request: RawRequest) -> Result<RawReply, TransportError>;
}

/// Sends a request and completes it into a [`Response`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportError> {
        (**self).send(request).await
    }
}

/// Transport for text and structured data.
///
/// Request data is serialized before sending: on `GET`/`HEAD` it is appended
/// to the query string, otherwise it becomes the body. A binary body cannot be
/// serialized; send it with `process_data(false)` or through the
/// [`BinaryTransportAdapter`].
pub struct DefaultTransport {
    exchange: Arc<dyn Exchange>,
    clock: Arc<dyn Clock>,
}

impl DefaultTransport {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self::with_clock(exchange, Arc::new(SystemClock))
    }

    /// Uses `clock` for cache-busting tokens.
    pub fn with_clock(exchange: Arc<dyn Exchange>, clock: Arc<dyn Clock>) -> Self {
        Self { exchange, clock }
    }

    fn prepare(&self, request: &RequestDescriptor) -> Result<RawRequest, TransportError> {
        let mut headers = request.headers().clone();
        let declared = request.declared_type();
        if !headers.contains("accept") {
            headers.insert("Accept", accept_for(declared));
        }

        let mut query = None;
        let mut body = Bytes::new();
        if let Some(data) = request.request_body() {
            let serialized = match data.serialize() {
                Some(s) => Some(s),
                None if !request.processes_data() => None,
                None => {
                    return Err(TransportError::Serialization(
                        "binary data cannot be converted into a query string; \
                         disable process_data or declare a binary response type"
                            .to_owned(),
                    ));
                }
            };

            match serialized {
                Some(s) if request.method().carries_query_data() => query = Some(s),
                Some(s) => {
                    data.apply_content_type(&mut headers);
                    body = Bytes::from(s);
                }
                None => {
                    // process_data(false) with a binary body: send as is.
                    if let RequestBody::Binary(raw) = data {
                        data.apply_content_type(&mut headers);
                        body = raw.clone();
                    }
                }
            }
        }

        Ok(RawRequest {
            method: request.method().clone(),
            url: target_url(request, query.as_deref(), self.clock.now_millis()),
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportError> {
        let raw = self.prepare(request)?;
        let reply = self.exchange.exchange(raw).await?;

        let content_type = reply.headers.get("content-type").map(str::to_owned);
        let response_type = request
            .declared_type()
            .cloned()
            .unwrap_or_else(|| ResponseType::infer(content_type.as_deref()));

        complete(reply, &declared_name(request, content_type.as_deref()), |raw| {
            Ok(Payload::decode(&response_type, raw)?)
        })
    }
}

/// The type name a response body is filed under: the request's declared
/// type, else the observed `Content-Type`, else `"text"`.
pub(crate) fn declared_name(request: &RequestDescriptor, content_type: Option<&str>) -> String {
    match (request.declared_type(), content_type) {
        (Some(declared), _) => declared.as_str().to_owned(),
        (None, Some(ct)) => ct.to_owned(),
        (None, None) => ResponseType::Text.as_str().to_owned(),
    }
}

/// Shared completion pathway for every transport.
///
/// Successful replies file the decoded body under `declared`. Failed replies
/// keep the raw body (or the status text, if empty) as text.
pub(crate) fn complete<F>(reply: RawReply, declared: &str, decode: F) -> Result<Response, TransportError>
where
    F: FnOnce(Bytes) -> Result<Payload, TransportError>,
{
    let RawReply {
        status,
        status_text,
        headers,
        body,
    } = reply;
    let raw_headers = headers.to_raw_string();
    let mut responses = BTreeMap::new();

    if is_success_status(status) {
        responses.insert(declared.to_owned(), decode(body)?);
        return Ok(Response::complete(status, status_text, declared, responses, raw_headers));
    }

    let text = if body.is_empty() {
        status_text.clone()
    } else {
        String::from_utf8_lossy(&body).into_owned()
    };
    responses.insert("text".to_owned(), Payload::Text(text));
    Ok(Response::complete(status, status_text, "text", responses, raw_headers))
}

/// Builds the URL actually requested: query data appended, and a fresh
/// `_=<now>` token when the caller asked for cache-busting.
pub(crate) fn target_url(request: &RequestDescriptor, query: Option<&str>, now: i64) -> String {
    let mut url = if request.busting_requested() {
        strip_busting_token(request.url())
    } else {
        request.url().to_owned()
    };

    let mut append = |pair: &str| {
        if pair.is_empty() {
            return;
        }
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(pair);
    };

    if let Some(query) = query {
        append(query);
    }
    if request.busting_requested() && request.method().carries_query_data() {
        append(&format!("_={now}"));
    }
    url
}

fn accept_for(declared: Option<&ResponseType>) -> &'static str {
    match declared {
        Some(ResponseType::Json) => "application/json, text/javascript, */*; q=0.01",
        Some(ResponseType::Text) => "text/plain, */*; q=0.01",
        _ => "*/*",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Exchange answering every request with one canned reply, recording what it saw.
    pub(crate) struct CannedExchange {
        reply: RawReply,
        pub seen: Mutex<Vec<RawRequest>>,
        pub calls: AtomicUsize,
    }

    impl CannedExchange {
        pub(crate) fn new(status: u16, content_type: &str, body: &'static [u8]) -> Self {
            let mut headers = Headers::new();
            headers.insert("Content-Type", content_type);
            Self {
                reply: RawReply {
                    status,
                    status_text: (if status == 200 { "OK" } else { "Not Found" }).to_owned(),
                    headers,
                    body: Bytes::from_static(body),
                },
                seen: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn last(&self) -> RawRequest {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Exchange for CannedExchange {
        async fn exchange(&self, request: RawRequest) -> Result<RawReply, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request);
            Ok(self.reply.clone())
        }
    }

    fn transport(exchange: Arc<CannedExchange>) -> DefaultTransport {
        DefaultTransport::with_clock(exchange, Arc::new(crate::clock::ManualClock::new(77)))
    }

    #[tokio::test]
    async fn get_data_goes_into_query_string() {
        let exchange = Arc::new(CannedExchange::new(200, "text/plain", b"ok"));
        let request = RequestDescriptor::get("/search?x=1")
            .body(RequestBody::Form(vec![("q".into(), "a b".into())]));
        transport(exchange.clone()).send(&request).await.unwrap();

        let sent = exchange.last();
        assert_eq!(sent.url, "/search?x=1&q=a+b");
        assert!(sent.body.is_empty());
    }

    #[tokio::test]
    async fn post_json_becomes_body() {
        let exchange = Arc::new(CannedExchange::new(200, "application/json", b"{}"));
        let request = RequestDescriptor::post("/items").body(json!({"a": 1}));
        transport(exchange.clone()).send(&request).await.unwrap();

        let sent = exchange.last();
        assert_eq!(sent.body.as_ref(), br#"{"a":1}"#);
        assert_eq!(sent.headers.get("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn busting_replaces_existing_token() {
        let exchange = Arc::new(CannedExchange::new(200, "text/plain", b"ok"));
        let request = RequestDescriptor::get("/api/x?_=1&y=2").cache(false);
        transport(exchange.clone()).send(&request).await.unwrap();
        assert_eq!(exchange.last().url, "/api/x?y=2&_=77");
    }

    #[tokio::test]
    async fn processed_binary_body_is_rejected() {
        let exchange = Arc::new(CannedExchange::new(200, "text/plain", b"ok"));
        let request = RequestDescriptor::post("/upload").body(Bytes::from_static(b"\x00"));
        let err = transport(exchange.clone()).send(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::Serialization(_)));
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unprocessed_binary_body_is_sent_raw() {
        let exchange = Arc::new(CannedExchange::new(200, "text/plain", b"ok"));
        let request = RequestDescriptor::post("/upload")
            .body(Bytes::from_static(b"\x00\x01"))
            .process_data(false);
        transport(exchange.clone()).send(&request).await.unwrap();
        assert_eq!(exchange.last().body.as_ref(), b"\x00\x01");
    }

    #[tokio::test]
    async fn declared_json_is_parsed_and_filed_under_json() {
        let exchange = Arc::new(CannedExchange::new(200, "application/json", br#"{"a":1}"#));
        let request = RequestDescriptor::get("/api/x").data_type(ResponseType::Json);
        let response = transport(exchange).send(&request).await.unwrap();

        assert_eq!(response.data_type(), "json");
        assert_eq!(response.body(), Some(&Payload::Json(json!({"a": 1}))));
        assert_eq!(response.content_type().as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn undeclared_type_is_filed_under_content_type() {
        let exchange = Arc::new(CannedExchange::new(200, "application/json", br#"[1]"#));
        let response = transport(exchange)
            .send(&RequestDescriptor::get("/api/x"))
            .await
            .unwrap();
        assert_eq!(response.data_type(), "application/json");
        assert_eq!(response.body(), Some(&Payload::Json(json!([1]))));
    }

    #[tokio::test]
    async fn failure_keeps_body_as_text() {
        let exchange = Arc::new(CannedExchange::new(404, "text/plain", b"no such thing"));
        let request = RequestDescriptor::get("/missing").data_type(ResponseType::Json);
        let response = transport(exchange).send(&request).await.unwrap();

        assert!(!response.is_success());
        assert_eq!(response.status(), 404);
        assert_eq!(
            response.body_for("text"),
            Some(&Payload::Text("no such thing".into()))
        );
    }

    #[test]
    fn target_url_without_busting_is_untouched() {
        let request = RequestDescriptor::get("/a?_=5");
        assert_eq!(target_url(&request, None, 9), "/a?_=5");
    }
}
