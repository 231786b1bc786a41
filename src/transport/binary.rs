//! Binary-preserving transport.
//!
//! Default request processing would try to turn a binary body into a query
//! string, and default response decoding would turn binary bytes into text.
//! [`BinaryTransportAdapter`] intercepts any request whose declared response
//! type is `blob`/`arraybuffer`, or whose body is binary, and performs the raw
//! exchange itself. The result is completed through the same pathway as every
//! other response, so the cache commit step cannot tell the difference.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{
    DefaultTransport, Exchange, RawRequest, Transport, TransportError, complete, declared_name,
    target_url,
};
use crate::clock::{Clock, SystemClock};
use crate::http::{Payload, RequestBody, RequestDescriptor, Response};

/// Routes binary requests straight to the exchange; delegates the rest to `T`.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use respcache::http::{RequestDescriptor, ResponseType};
/// use respcache::transport::{BinaryTransportAdapter, TcpExchange, Transport};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = BinaryTransportAdapter::over(Arc::new(TcpExchange::new()));
/// let image = RequestDescriptor::get("http://127.0.0.1:8080/logo.png")
///     .data_type(ResponseType::Blob);
/// let response = transport.send(&image).await?;
/// assert_eq!(response.data_type(), "blob");
/// # Ok(())
/// # }
/// ```
pub struct BinaryTransportAdapter<T> {
    inner: T,
    exchange: Arc<dyn Exchange>,
    clock: Arc<dyn Clock>,
}

impl BinaryTransportAdapter<DefaultTransport> {
    /// The usual stack: binary requests handled here, everything else by a
    /// [`DefaultTransport`] over the same exchange.
    pub fn over(exchange: Arc<dyn Exchange>) -> Self {
        Self::over_with_clock(exchange, Arc::new(SystemClock))
    }

    /// Like [`over`](Self::over), using `clock` for cache-busting tokens.
    pub fn over_with_clock(exchange: Arc<dyn Exchange>, clock: Arc<dyn Clock>) -> Self {
        let inner = DefaultTransport::with_clock(Arc::clone(&exchange), Arc::clone(&clock));
        Self {
            inner,
            exchange,
            clock,
        }
    }
}

impl<T: Transport> BinaryTransportAdapter<T> {
    /// Wraps an arbitrary transport.
    pub fn new(inner: T, exchange: Arc<dyn Exchange>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            exchange,
            clock,
        }
    }

    fn prepare(&self, request: &RequestDescriptor) -> RawRequest {
        let mut headers = request.headers().clone();
        let mut query = None;
        let mut body = Bytes::new();

        match request.request_body() {
            Some(data @ RequestBody::Binary(raw)) => {
                data.apply_content_type(&mut headers);
                body = raw.clone();
            }
            Some(data) => {
                let serialized = data.serialize().unwrap_or_default();
                if request.method().carries_query_data() {
                    query = Some(serialized);
                } else {
                    data.apply_content_type(&mut headers);
                    body = Bytes::from(serialized);
                }
            }
            None => {}
        }

        RawRequest {
            method: request.method().clone(),
            url: target_url(request, query.as_deref(), self.clock.now_millis()),
            headers,
            body,
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for BinaryTransportAdapter<T> {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportError> {
        if !request.is_binary() {
            return self.inner.send(request).await;
        }

        debug!(url = %request.url(), method = %request.method(), "binary exchange");
        let reply = self.exchange.exchange(self.prepare(request)).await?;

        let content_type = reply.headers.get("content-type").map(str::to_owned);
        let declared = declared_name(request, content_type.as_deref());
        // A binary upload may still expect a textual answer.
        let textual = request.declared_type().filter(|declared| !declared.is_binary());
        complete(reply, &declared, |raw| match textual {
            Some(declared) => Ok(Payload::decode(declared, raw)?),
            None => Ok(Payload::Binary(raw)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http::ResponseType;
    use crate::transport::tests::CannedExchange;

    const PNG_HEAD: &[u8] = b"\x89PNG\r\n\x1a\n\x00\xff\xfe";

    fn adapter(exchange: Arc<CannedExchange>) -> BinaryTransportAdapter<DefaultTransport> {
        BinaryTransportAdapter::over_with_clock(exchange, Arc::new(ManualClock::new(5)))
    }

    #[tokio::test]
    async fn blob_response_is_kept_byte_for_byte() {
        let exchange = Arc::new(CannedExchange::new(200, "image/png", PNG_HEAD));
        let request = RequestDescriptor::get("/logo.png").data_type(ResponseType::Blob);
        let response = adapter(exchange.clone()).send(&request).await.unwrap();

        assert_eq!(response.data_type(), "blob");
        assert_eq!(response.body(), Some(&Payload::Binary(Bytes::from_static(PNG_HEAD))));
        assert!(!exchange.last().headers.contains("accept"));
    }

    #[tokio::test]
    async fn binary_upload_is_not_serialized() {
        let exchange = Arc::new(CannedExchange::new(200, "application/json", br#"{"ok":true}"#));
        let request = RequestDescriptor::post("/upload")
            .body(Bytes::from_static(PNG_HEAD))
            .data_type(ResponseType::Json);
        let response = adapter(exchange.clone()).send(&request).await.unwrap();

        let sent = exchange.last();
        assert_eq!(sent.body.as_ref(), PNG_HEAD);
        assert_eq!(sent.headers.get("content-type"), Some("application/octet-stream"));
        assert_eq!(
            response.body(),
            Some(&Payload::Json(serde_json::json!({"ok": true})))
        );
    }

    #[tokio::test]
    async fn binary_failure_reports_status_text() {
        let exchange = Arc::new(CannedExchange::new(404, "image/png", b""));
        let request = RequestDescriptor::get("/missing.png").data_type(ResponseType::ArrayBuffer);
        let response = adapter(exchange).send(&request).await.unwrap();

        assert_eq!(response.status(), 404);
        assert_eq!(response.body_for("text"), Some(&Payload::Text("Not Found".into())));
    }

    #[tokio::test]
    async fn textual_requests_are_delegated() {
        let exchange = Arc::new(CannedExchange::new(200, "text/plain", b"hello"));
        let request = RequestDescriptor::get("/greeting").data_type(ResponseType::Text);
        let response = adapter(exchange.clone()).send(&request).await.unwrap();

        assert_eq!(response.body(), Some(&Payload::Text("hello".into())));
        // Only the default transport sets Accept.
        assert!(exchange.last().headers.contains("accept"));
    }

    #[tokio::test]
    async fn get_data_goes_into_query_string() {
        let exchange = Arc::new(CannedExchange::new(200, "image/png", PNG_HEAD));
        let request = RequestDescriptor::get("/thumb")
            .body(RequestBody::Form(vec![("size".into(), "64".into())]))
            .data_type(ResponseType::Blob);
        adapter(exchange.clone()).send(&request).await.unwrap();

        let sent = exchange.last();
        assert_eq!(sent.url, "/thumb?size=64");
        assert!(sent.body.is_empty());
        assert!(!sent.headers.contains("content-type"));
    }

    #[tokio::test]
    async fn post_data_with_blob_response_stays_in_body() {
        let exchange = Arc::new(CannedExchange::new(200, "image/png", PNG_HEAD));
        let request = RequestDescriptor::post("/render")
            .body(RequestBody::Form(vec![("size".into(), "64".into())]))
            .data_type(ResponseType::Blob);
        adapter(exchange.clone()).send(&request).await.unwrap();

        let sent = exchange.last();
        assert_eq!(sent.url, "/render");
        assert_eq!(sent.body.as_ref(), b"size=64");
    }

    #[tokio::test]
    async fn busting_applies_to_binary_requests() {
        let exchange = Arc::new(CannedExchange::new(200, "image/png", PNG_HEAD));
        let request = RequestDescriptor::get("/logo.png?_=1")
            .data_type(ResponseType::Blob)
            .cache(false);
        adapter(exchange.clone()).send(&request).await.unwrap();
        assert_eq!(exchange.last().url, "/logo.png?_=5");
    }
}
