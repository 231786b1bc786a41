//! Cache key derivation.
//!
//! A key is the raw concatenation `url + METHOD + body`. Nothing is hashed, so
//! keys are deterministic and readable in the key storage, at the price of
//! being as long as the request.

use crate::http::{RequestBody, RequestDescriptor};

/// Query parameter name of the cache-busting token.
const BUSTING_PARAM: &str = "_";

/// Derives the cache key for `request`.
///
/// An explicit `cache_key` wins unchanged. Otherwise the URL (with busting
/// tokens stripped when busting is requested), the upper-case method and the
/// body's key fragment are concatenated.
///
/// # Examples
///
/// ```
/// use respcache::cache::derive_key;
/// use respcache::http::RequestDescriptor;
///
/// let request = RequestDescriptor::get("/api/x?_=1700000000000").cache(false);
/// assert_eq!(derive_key(&request), "/api/xGET");
///
/// let named = RequestDescriptor::get("/api/x").cache_key("profile");
/// assert_eq!(derive_key(&named), "profile");
/// ```
pub fn derive_key(request: &RequestDescriptor) -> String {
    if let Some(key) = request.explicit_cache_key() {
        return key.to_owned();
    }

    let url = if request.busting_requested() {
        strip_busting_token(request.url())
    } else {
        request.url().to_owned()
    };
    let body = request
        .request_body()
        .map(RequestBody::key_fragment)
        .unwrap_or_default();

    format!("{url}{}{body}", request.method())
}

/// Removes every `_=<value>` parameter from the query string of `url`.
///
/// The remaining parameters keep their order; a query left empty loses its
/// `?`. The fragment, if any, is preserved.
///
/// ```
/// use respcache::cache::strip_busting_token;
///
/// assert_eq!(strip_busting_token("/api/x?_=1&y=2"), "/api/x?y=2");
/// assert_eq!(strip_busting_token("/a?_=1"), "/a");
/// assert_eq!(strip_busting_token("/a?b=1&_=2#top"), "/a?b=1#top");
/// ```
pub fn strip_busting_token(url: &str) -> String {
    let (rest, fragment) = match url.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (url, None),
    };
    let Some((path, query)) = rest.split_once('?') else {
        return url.to_owned();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name);
            !pair.is_empty() && name != BUSTING_PARAM
        })
        .collect();

    let mut out = String::with_capacity(url.len());
    out.push_str(path);
    if !kept.is_empty() {
        out.push('?');
        out.push_str(&kept.join("&"));
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}
