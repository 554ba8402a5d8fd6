//! Captured request/response pairs and their correlation keys

use crate::http::HttpHeaders;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use url::Url;

/// Accept types that mark a request as a page navigation rather than a sub-resource fetch
const PAGE_CLASS_ACCEPT: &[&str] = &[
    "text/html",
    "application/xhtml+xml",
    "application/json",
    "text/json",
];

/// Outgoing request as seen by the proxy hooks
#[derive(Debug, Clone, Serialize)]
pub struct ProxyRequest {
    /// Browser instance that issued the request (0 when unknown)
    pub process_id: u32,
    pub method: String,
    pub url: String,
    pub headers: HttpHeaders,
    pub body: Option<Vec<u8>>,
}

/// Response relayed back to the browser
#[derive(Debug, Clone, Serialize)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
    /// Served by the proxy cache without contacting the origin
    pub from_cache: bool,
}

impl ProxyResponse {
    pub fn new(status: u16, headers: HttpHeaders, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            from_cache: false,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// One request/response round trip through the proxy
#[derive(Debug, Clone, Serialize)]
pub struct ProxySession {
    pub started_at: DateTime<Utc>,
    pub request: ProxyRequest,
    pub response: Option<ProxyResponse>,
    /// Whether the response body is kept for inspection after publication
    pub buffer_response: bool,
}

impl ProxySession {
    pub fn new(
        process_id: u32,
        method: impl Into<String>,
        url: impl Into<String>,
        headers: HttpHeaders,
    ) -> Self {
        Self {
            started_at: Utc::now(),
            request: ProxyRequest {
                process_id,
                method: method.into(),
                url: url.into(),
                headers,
                body: None,
            },
            response: None,
            buffer_response: false,
        }
    }

    /// Host of the request URL, empty when the URL cannot be parsed
    pub fn host(&self) -> String {
        Url::parse(&self.request.url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default()
    }

    /// A page-class request expects an HTML or JSON document
    pub fn is_page_class(&self) -> bool {
        self.request
            .headers
            .get("accept")
            .map(|accept| {
                let accept = accept.to_lowercase();
                PAGE_CLASS_ACCEPT.iter().any(|t| accept.contains(t))
            })
            .unwrap_or(false)
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::new(self.request.process_id, &self.request.url)
    }
}

/// The (process id, full URL) pair that ties a proxied response to the
/// navigation that caused it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub process_id: u32,
    pub url: String,
}

impl CorrelationKey {
    /// Builds a key, normalizing the URL so browser- and proxy-side spellings agree
    pub fn new(process_id: u32, url: &str) -> Self {
        let url = Url::parse(url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.to_string());
        Self { process_id, url }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.process_id, self.url)
    }
}
