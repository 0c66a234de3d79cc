use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;

use crate::Result;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection-local headers that must not cross the proxy in either
/// direction (RFC 7230 hop-by-hop set, plus host and content-length which
/// the HTTP stack recomputes).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

const INTERNAL_HEADER_PREFIX: &str = "x-majordomo-";

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_time: Duration,
}

/// Forwards buffered requests upstream. Redirects are disabled and the
/// transport decompresses gzip responses, so parsed bodies are always plain
/// bytes.
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Sends the request to `base_url` + the original path and query, with
    /// hygienic headers, and reads the full response body into memory.
    pub async fn forward(
        &self,
        base_url: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let start = Instant::now();
        let url = format!("{base_url}{path_and_query}");

        let response = self
            .http
            .request(method, &url)
            .headers(request_headers(headers))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            response_time: start.elapsed(),
        })
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Copies inbound headers for the upstream request, dropping gateway-internal
/// `x-majordomo-*` headers, the hop-by-hop set, and `accept-encoding` (the
/// transport negotiates its own compression).
pub fn request_headers(src: &HeaderMap) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        let lower = name.as_str().to_ascii_lowercase();
        if lower.starts_with(INTERNAL_HEADER_PREFIX)
            || is_hop_by_hop(&lower)
            || lower == "accept-encoding"
        {
            continue;
        }
        dst.append(name, value.clone());
    }
    dst
}

/// Copies upstream response headers for the caller, dropping the hop-by-hop
/// set and `content-encoding` (the transport already decompressed the body).
pub fn response_headers(src: &HeaderMap) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lower) || lower == "content-encoding" {
            continue;
        }
        dst.append(name, value.clone());
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn request_headers_strip_internal_and_hop_by_hop() {
        let src = header_map(&[
            ("authorization", "Bearer sk-upstream"),
            ("content-type", "application/json"),
            ("x-majordomo-key", "mdm_sk_secret"),
            ("x-majordomo-user", "u-1"),
            ("connection", "keep-alive"),
            ("host", "gateway.internal"),
            ("content-length", "42"),
            ("accept-encoding", "gzip, br"),
            ("transfer-encoding", "chunked"),
        ]);
        let dst = request_headers(&src);

        assert_eq!(dst.get("authorization").unwrap(), "Bearer sk-upstream");
        assert_eq!(dst.get("content-type").unwrap(), "application/json");
        assert_eq!(dst.len(), 2);
    }

    #[test]
    fn response_headers_strip_content_encoding() {
        let src = header_map(&[
            ("content-type", "application/json"),
            ("content-encoding", "gzip"),
            ("content-length", "100"),
            ("connection", "close"),
            ("x-request-id", "abc"),
        ]);
        let dst = response_headers(&src);

        assert_eq!(dst.get("content-type").unwrap(), "application/json");
        assert_eq!(dst.get("x-request-id").unwrap(), "abc");
        assert!(dst.get("content-encoding").is_none());
        assert!(dst.get("content-length").is_none());
        assert!(dst.get("connection").is_none());
    }

    #[test]
    fn repeated_headers_survive_the_copy() {
        let mut src = HeaderMap::new();
        src.append("set-cookie", "a=1".parse().unwrap());
        src.append("set-cookie", "b=2".parse().unwrap());
        let dst = response_headers(&src);
        assert_eq!(dst.get_all("set-cookie").iter().count(), 2);
    }
}
