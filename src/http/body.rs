//! Request and response body types.
//!
//! A cached response body is a [`Payload`]: text, a parsed JSON document, or
//! raw bytes. The declared [`ResponseType`] of a request decides which one a
//! response decodes into.

use std::fmt::{self, Write as _};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::Headers;

/// The response type a request declares (its `dataType`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Text,
    Json,
    /// Opaque binary blob.
    Blob,
    /// Binary buffer; stored the same way as [`ResponseType::Blob`].
    ArrayBuffer,
    /// Any other declared type. The body is kept as text.
    Other(String),
}

impl ResponseType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Blob => "blob",
            Self::ArrayBuffer => "arraybuffer",
            Self::Other(s) => s.as_str(),
        }
    }

    /// Returns `true` for the declared types whose body must never be coerced
    /// into a string.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Blob | Self::ArrayBuffer)
    }

    /// Guesses a response type from a `Content-Type` header value.
    pub fn infer(content_type: Option<&str>) -> Self {
        let Some(mime) = content_type else {
            return Self::Text;
        };
        let mime = mime.to_ascii_lowercase();
        if mime.contains("json") {
            Self::Json
        } else if mime.starts_with("text/") || mime.contains("xml") || mime.contains("javascript")
        {
            Self::Text
        } else {
            Self::Blob
        }
    }
}

impl std::str::FromStr for ResponseType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "text" => Self::Text,
            "json" => Self::Json,
            "blob" => Self::Blob,
            "arraybuffer" => Self::ArrayBuffer,
            other => Self::Other(other.to_owned()),
        })
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response body as stored in, and served from, the payload store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    Binary(Bytes),
}

impl Payload {
    /// The runtime type tag used as the content type when none is declared.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::Json(_) => "object",
            Self::Binary(_) => "binary",
        }
    }

    /// Decodes a raw response body according to the declared type.
    ///
    /// Binary types keep the bytes untouched. JSON is parsed. Everything else
    /// is decoded as (lossy) UTF-8 text.
    pub fn decode(declared: &ResponseType, raw: Bytes) -> Result<Self, serde_json::Error> {
        match declared {
            ResponseType::Blob | ResponseType::ArrayBuffer => Ok(Self::Binary(raw)),
            ResponseType::Json if raw.is_empty() => Ok(Self::Json(serde_json::Value::Null)),
            ResponseType::Json => serde_json::from_slice(&raw).map(Self::Json),
            ResponseType::Text | ResponseType::Other(_) => {
                Ok(Self::Text(String::from_utf8_lossy(&raw).into_owned()))
            }
        }
    }

    /// Returns the text content, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the JSON document, if this is a JSON payload.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a binary payload.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// Data attached to an outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Text(String),
    /// Key/value pairs, url-encoded when serialized.
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
    Binary(Bytes),
}

impl RequestBody {
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Serializes the body the way request data is processed by default:
    /// forms are url-encoded, JSON is written compactly, text is sent as is.
    ///
    /// Returns `None` for binary bodies, which have no string form on the wire.
    pub fn serialize(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Form(pairs) => Some(
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs.iter())
                    .finish(),
            ),
            Self::Json(v) => Some(v.to_string()),
            Self::Binary(_) => None,
        }
    }

    /// The string this body contributes to a cache key. Binary bodies are
    /// written as lowercase hex so distinct blobs give distinct keys.
    pub fn key_fragment(&self) -> String {
        match self {
            Self::Binary(bytes) => {
                let mut out = String::with_capacity(bytes.len() * 2);
                for b in bytes.iter() {
                    let _ = write!(out, "{b:02x}");
                }
                out
            }
            other => other.serialize().unwrap_or_default(),
        }
    }

    /// Default `Content-Type` for the serialized form of this body.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text/plain; charset=utf-8",
            Self::Form(_) => "application/x-www-form-urlencoded; charset=UTF-8",
            Self::Json(_) => "application/json",
            Self::Binary(_) => "application/octet-stream",
        }
    }

    /// Adds a `Content-Type` header for this body unless one is already set.
    pub fn apply_content_type(&self, headers: &mut Headers) {
        if !headers.contains("content-type") {
            headers.insert("Content-Type", self.default_content_type());
        }
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}
