//! Thin forwarding adapter over a single upstream base URL.

use crate::proxy::error::ApiError;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use url::Url;

// Headers that must not be relayed in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Host and Content-Length are recomputed by the upstream client.
// Accept-Encoding is dropped so the upstream never compresses a body the
// response filter has to inspect.
const STRIP_FROM_REQUEST: [&str; 3] = ["host", "content-length", "accept-encoding"];

// Response bodies are buffered (and possibly rewritten), so the length is
// recomputed when the response is re-assembled.
const STRIP_FROM_RESPONSE: [&str; 1] = ["content-length"];

#[derive(Debug)]
pub struct Upstream {
    client: reqwest::Client,
    base: Url,
}

impl Upstream {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }

    /// Build the upstream URL for a request path and (already re-encoded)
    /// query string, preserving any path prefix of the base URL.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", prefix, path));
        url.set_query(query);
        url
    }

    /// Forward a request and return the upstream response. Transport errors
    /// map to 502.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.url_for(path, query);
        let mut request = self
            .client
            .request(method, url)
            .headers(filter_request_headers(headers));
        if let Some(body) = body {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|err| ApiError::BadGateway(format!("error sending request to upstream: {}", err)))
    }
}

fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || STRIP_FROM_REQUEST.contains(&lower.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Drop hop-by-hop headers (and the now-stale `Content-Length`) from an
/// upstream response before relaying it.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || STRIP_FROM_RESPONSE.contains(&lower.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
