//! Completed responses, whether they came off the network or out of the cache.
//!
//! Every response is completed through [`Response::complete`] with a numeric
//! status, a status text, a map of bodies keyed by declared type, and the raw
//! header block. A consumer reads the body under the request's declared type
//! and gets the same answer whether or not the cache was involved.

use std::collections::BTreeMap;

use super::{Headers, Payload, StatusCode, is_success_status};
use crate::store::PayloadEntry;

/// Status text of a response served from the cache.
pub const CACHE_SUCCESS_TEXT: &str = "success";

/// Status text of a declared cache hit whose payload could not be read.
pub const CACHE_FAILURE_TEXT: &str = "cache failure";

/// A completed response.
///
/// # Examples
///
/// ```
/// use respcache::http::{Payload, Response};
/// use serde_json::json;
///
/// let response = Response::complete(
///     200,
///     "OK",
///     "json",
///     [("json".to_owned(), Payload::Json(json!({"a": 1})))].into(),
///     "Content-Type: application/json\r\n",
/// );
/// assert!(response.is_success());
/// assert_eq!(response.body().and_then(Payload::as_json), Some(&json!({"a": 1})));
/// assert_eq!(response.content_type(), Some("application/json".to_owned()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    status_text: String,
    data_type: String,
    responses: BTreeMap<String, Payload>,
    raw_headers: String,
}

impl Response {
    /// The single completion pathway shared by network and cache responses.
    pub fn complete(
        status: u16,
        status_text: impl Into<String>,
        data_type: impl Into<String>,
        responses: BTreeMap<String, Payload>,
        raw_headers: impl Into<String>,
    ) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            data_type: data_type.into(),
            responses,
            raw_headers: raw_headers.into(),
        }
    }

    /// Synthesizes the response for a cache hit: `200 success`, the stored body
    /// under the stored content type, no headers.
    pub fn from_cache(entry: PayloadEntry) -> Self {
        let PayloadEntry {
            content_type, body, ..
        } = entry;
        let mut responses = BTreeMap::new();
        responses.insert(content_type.clone(), body);
        Self::complete(
            StatusCode::Ok.as_u16(),
            CACHE_SUCCESS_TEXT,
            content_type,
            responses,
            String::new(),
        )
    }

    /// Synthesizes the failure reported when a declared hit cannot be read.
    pub fn cache_failure() -> Self {
        Self::complete(
            StatusCode::InternalServerError.as_u16(),
            CACHE_FAILURE_TEXT,
            "text",
            BTreeMap::new(),
            String::new(),
        )
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// Returns `true` for 2xx and 304.
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }

    /// The declared type the body is stored under.
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// The body under the declared type.
    pub fn body(&self) -> Option<&Payload> {
        self.responses.get(&self.data_type)
    }

    /// The body stored under an arbitrary type name.
    pub fn body_for(&self, data_type: &str) -> Option<&Payload> {
        self.responses.get(data_type)
    }

    /// All bodies, keyed by type name.
    pub fn responses(&self) -> &BTreeMap<String, Payload> {
        &self.responses
    }

    /// Consumes the response, returning the body under the declared type.
    pub fn into_body(mut self) -> Option<Payload> {
        self.responses.remove(&self.data_type)
    }

    /// The raw `Name: value\r\n` header block.
    pub fn raw_headers(&self) -> &str {
        &self.raw_headers
    }

    /// The header block parsed into a map.
    pub fn headers(&self) -> Headers {
        Headers::parse_raw(&self.raw_headers)
    }

    /// The `Content-Type` header, if the response carried one.
    pub fn content_type(&self) -> Option<String> {
        self.headers().get("content-type").map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn cache_hit_keys_body_by_stored_type() {
        let entry = PayloadEntry::new("k", 7, "blob", Payload::Binary(Bytes::from_static(b"\x00\x01")));
        let response = Response::from_cache(entry);
        assert_eq!(response.status(), 200);
        assert_eq!(response.status_text(), "success");
        assert_eq!(response.data_type(), "blob");
        assert_eq!(
            response.body_for("blob").and_then(Payload::as_bytes).map(|b| &b[..]),
            Some(&b"\x00\x01"[..])
        );
        assert_eq!(response.raw_headers(), "");
    }

    #[test]
    fn cache_failure_is_not_success() {
        let response = Response::cache_failure();
        assert_eq!(response.status(), 500);
        assert_eq!(response.status_text(), "cache failure");
        assert!(!response.is_success());
        assert!(response.body().is_none());
    }

    #[test]
    fn into_body_takes_declared_entry() {
        let mut responses = BTreeMap::new();
        responses.insert("text".to_owned(), Payload::Text("hi".to_owned()));
        let response = Response::complete(200, "OK", "text", responses, "");
        assert_eq!(response.into_body(), Some(Payload::Text("hi".to_owned())));
    }
}
