//! Outgoing request descriptors and their cache options.
//!
//! A [`RequestDescriptor`] is what a caller hands to the cache coordinator: the
//! URL, method and body of the request, the declared response type, and the
//! cache extension fields (`local_cache`, `cache_ttl`, `cache_key`,
//! `is_cache_valid`, `cache`).
//!
//! Descriptors are built either through the fluent builder, or from a dynamic
//! [`RequestOptions`] object (for example one deserialized from JSON), in which
//! case the `localCache` value is validated before anything else happens.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use super::{Headers, Method, RequestBody, ResponseType};
use crate::error::CacheError;
use crate::index::KeyStorage;

/// Caller-supplied predicate deciding whether an existing cache entry may be used.
pub type ValidityCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Which key storage a request caches through, if any.
#[derive(Clone, Default)]
pub enum LocalCache {
    /// Caching is off for this request; it passes straight to the transport.
    #[default]
    Disabled,
    /// Use the coordinator's default key storage.
    Default,
    /// Use the given key storage.
    Custom(Arc<dyn KeyStorage>),
}

impl LocalCache {
    /// Interprets a dynamic `localCache` option value.
    ///
    /// `true` selects the default storage. Falsy values (`false`, `null`, `0`,
    /// `""`) disable caching. Anything else cannot be a storage object and is
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Configuration`] for any other value.
    ///
    /// # Examples
    ///
    /// ```
    /// use respcache::http::LocalCache;
    /// use serde_json::json;
    ///
    /// assert!(matches!(LocalCache::from_value(&json!(true)), Ok(LocalCache::Default)));
    /// assert!(matches!(LocalCache::from_value(&json!(0)), Ok(LocalCache::Disabled)));
    /// assert!(LocalCache::from_value(&json!("yes")).is_err());
    /// ```
    pub fn from_value(value: &serde_json::Value) -> Result<Self, CacheError> {
        use serde_json::Value;

        match value {
            Value::Bool(true) => Ok(Self::Default),
            Value::Null | Value::Bool(false) => Ok(Self::Disabled),
            Value::Number(n) if n.as_f64() == Some(0.0) => Ok(Self::Disabled),
            Value::String(s) if s.is_empty() => Ok(Self::Disabled),
            other => Err(CacheError::Configuration(format!(
                "localCache must either be a boolean value or an object implementing \
                 the key storage interface, got {other}"
            ))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl From<bool> for LocalCache {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Default } else { Self::Disabled }
    }
}

impl From<Arc<dyn KeyStorage>> for LocalCache {
    fn from(storage: Arc<dyn KeyStorage>) -> Self {
        Self::Custom(storage)
    }
}

impl fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Default => f.write_str("Default"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A request as seen by the cache layer.
///
/// # Examples
///
/// ```
/// use respcache::http::{Method, RequestDescriptor, ResponseType};
///
/// let request = RequestDescriptor::get("/api/items?page=2")
///     .data_type(ResponseType::Json)
///     .local_cache(true)
///     .cache_ttl(1.0);
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.cache_ttl_hours(), Some(1.0));
/// assert!(request.local_cache_option().is_enabled());
/// ```
#[derive(Clone)]
pub struct RequestDescriptor {
    url: String,
    method: Method,
    headers: Headers,
    body: Option<RequestBody>,
    data_type: Option<ResponseType>,
    process_data: bool,
    local_cache: LocalCache,
    cache_ttl: Option<f64>,
    cache_key: Option<String>,
    is_cache_valid: Option<ValidityCheck>,
    cache: Option<bool>,
}

impl RequestDescriptor {
    /// Creates a request for `url` with the given method and no cache options.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Headers::new(),
            body: None,
            data_type: None,
            process_data: true,
            local_cache: LocalCache::Disabled,
            cache_ttl: None,
            cache_key: None,
            is_cache_valid: None,
            cache: None,
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Shorthand for a `POST` request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attaches request data.
    #[must_use]
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Declares the expected response type.
    #[must_use]
    pub fn data_type(mut self, data_type: ResponseType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    /// Controls whether request data is serialized before sending.
    /// Binary bodies must be sent with `process_data(false)` unless the
    /// request goes through the binary transport.
    #[must_use]
    pub fn process_data(mut self, process: bool) -> Self {
        self.process_data = process;
        self
    }

    /// Selects the key storage used to cache this request.
    #[must_use]
    pub fn local_cache(mut self, local_cache: impl Into<LocalCache>) -> Self {
        self.local_cache = local_cache.into();
        self
    }

    /// Cache lifetime in hours. Zero or negative values fall back to the default.
    #[must_use]
    pub fn cache_ttl(mut self, hours: f64) -> Self {
        self.cache_ttl = Some(hours);
        self
    }

    /// Caches under an explicit key instead of a derived one.
    #[must_use]
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Installs a predicate consulted before every cache read; returning
    /// `false` discards the cached entry.
    #[must_use]
    pub fn is_cache_valid<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.is_cache_valid = Some(Arc::new(check));
        self
    }

    /// Browser-style cache flag: `false` adds a `_=<timestamp>` busting token
    /// to the URL when the request is sent.
    #[must_use]
    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn request_body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// The explicitly declared response type, if any.
    pub fn declared_type(&self) -> Option<&ResponseType> {
        self.data_type.as_ref()
    }

    pub fn processes_data(&self) -> bool {
        self.process_data
    }

    pub fn local_cache_option(&self) -> &LocalCache {
        &self.local_cache
    }

    pub fn cache_ttl_hours(&self) -> Option<f64> {
        self.cache_ttl
    }

    pub fn explicit_cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub fn validity_check(&self) -> Option<&ValidityCheck> {
        self.is_cache_valid.as_ref()
    }

    /// Returns `true` when the caller asked for cache-busting (`cache == false`).
    pub fn busting_requested(&self) -> bool {
        self.cache == Some(false)
    }

    /// Returns `true` if either the request body or the declared response
    /// type is binary.
    pub fn is_binary(&self) -> bool {
        self.data_type.as_ref().is_some_and(ResponseType::is_binary)
            || self.body.as_ref().is_some_and(RequestBody::is_binary)
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("data_type", &self.data_type)
            .field("process_data", &self.process_data)
            .field("local_cache", &self.local_cache)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_key", &self.cache_key)
            .field("is_cache_valid", &self.is_cache_valid.is_some())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Dynamic request options, shaped like a classic ajax settings object.
///
/// ```
/// use respcache::http::{RequestDescriptor, RequestOptions};
///
/// let options: RequestOptions = serde_json::from_str(
///     r#"{"url": "/api/x", "type": "GET", "localCache": true, "cacheTTL": 1}"#,
/// ).unwrap();
/// let request = RequestDescriptor::try_from(options).unwrap();
/// assert_eq!(request.url(), "/api/x");
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestOptions {
    pub url: String,
    #[serde(rename = "type", alias = "method")]
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data: Option<serde_json::Value>,
    pub data_type: Option<String>,
    pub process_data: Option<bool>,
    pub local_cache: serde_json::Value,
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: Option<f64>,
    pub cache_key: Option<String>,
    pub cache: Option<bool>,
}

impl TryFrom<RequestOptions> for RequestDescriptor {
    type Error = CacheError;

    fn try_from(options: RequestOptions) -> Result<Self, Self::Error> {
        // Validated first so a bad option fails before anything is built or sent.
        let local_cache = LocalCache::from_value(&options.local_cache)?;

        let method = options
            .method
            .as_deref()
            .map(|m| m.parse::<Method>().unwrap_or_default())
            .unwrap_or_default();

        let mut request = Self::new(method, options.url).local_cache(local_cache);
        for (name, value) in options.headers {
            request.headers.insert(name, value);
        }
        request.body = options.data.and_then(body_from_value);
        request.data_type = options
            .data_type
            .map(|t| t.parse::<ResponseType>().unwrap_or(ResponseType::Text));
        if let Some(process) = options.process_data {
            request.process_data = process;
        }
        request.cache_ttl = options.cache_ttl;
        request.cache_key = options.cache_key;
        request.cache = options.cache;
        Ok(request)
    }
}

/// Objects become form data, strings stay text, everything else is sent as JSON.
fn body_from_value(value: serde_json::Value) -> Option<RequestBody> {
    use serde_json::Value;

    match value {
        Value::Null => None,
        Value::String(s) => Some(RequestBody::Text(s)),
        Value::Object(map) => Some(RequestBody::Form(
            map.into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect(),
        )),
        other => Some(RequestBody::Json(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: serde_json::Value) -> RequestOptions {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn truthy_non_object_local_cache_is_rejected() {
        for bad in [json!("yes"), json!(1), json!([1]), json!({"getItem": true})] {
            let err = RequestDescriptor::try_from(options(json!({"url": "/", "localCache": bad})))
                .unwrap_err();
            assert!(matches!(err, CacheError::Configuration(_)));
        }
    }

    #[test]
    fn falsy_local_cache_disables_caching() {
        for falsy in [json!(false), json!(null), json!(0), json!("")] {
            let req =
                RequestDescriptor::try_from(options(json!({"url": "/", "localCache": falsy})))
                    .unwrap();
            assert!(!req.local_cache_option().is_enabled());
        }
    }

    #[test]
    fn options_map_onto_descriptor() {
        let req = RequestDescriptor::try_from(options(json!({
            "url": "/api/x?_=123",
            "type": "post",
            "data": {"a": 1, "b": "two"},
            "dataType": "json",
            "localCache": true,
            "cacheTTL": 2.5,
            "cacheKey": "k",
            "cache": false,
            "headers": {"Accept": "application/json"}
        })))
        .unwrap();

        assert_eq!(req.method(), &Method::Post);
        assert_eq!(req.declared_type(), Some(&ResponseType::Json));
        assert_eq!(req.cache_ttl_hours(), Some(2.5));
        assert_eq!(req.explicit_cache_key(), Some("k"));
        assert!(req.busting_requested());
        assert_eq!(req.headers().get("accept"), Some("application/json"));
        assert_eq!(
            req.request_body().and_then(RequestBody::serialize).as_deref(),
            Some("a=1&b=two")
        );
    }

    #[test]
    fn binary_detection() {
        let req = RequestDescriptor::get("/img.png").data_type(ResponseType::Blob);
        assert!(req.is_binary());
        let req = RequestDescriptor::post("/upload").body(bytes::Bytes::from_static(b"\x89PNG"));
        assert!(req.is_binary());
        assert!(!RequestDescriptor::get("/text").is_binary());
    }

    #[test]
    fn validity_check_is_callable() {
        let req = RequestDescriptor::get("/").is_cache_valid(|| false);
        let check = req.validity_check().unwrap();
        assert!(!check());
    }
}
