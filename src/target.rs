//! Scan target: a URL split into its base and its query parameters

use crate::error::Result;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

/// Characters that would change the structure of a query string if sent raw
const QUERY_DELIMITERS: &AsciiSet = &CONTROLS.add(b'%').add(b'&').add(b'#').add(b'+');

/// One query-string parameter of a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlParameter {
    pub name: String,
    pub value: String,
    /// Name exactly as it appeared in the query
    #[serde(skip)]
    raw_name: String,
    /// `name=value` segment exactly as it appeared in the query
    #[serde(skip)]
    raw_segment: String,
}

/// A parsed target URL
#[derive(Debug, Clone)]
pub struct Target {
    uri: Url,
    url_base: String,
    params: Vec<UrlParameter>,
    content: Option<String>,
}

impl Target {
    /// Parses `url` into base and parameters.
    ///
    /// The base is the URL as given up to the query, so `http://host?q=1`
    /// has base `http://host`. Repeated parameter names keep their first value.
    /// Parameters keep their original encoding so rebuilt queries only differ
    /// in the value being fuzzed.
    pub fn create(url: &str) -> Result<Self> {
        let uri = Url::parse(url.trim())?;

        let raw = url.trim();
        let end = raw.find(['?', '#']).unwrap_or(raw.len());
        let url_base = raw[..end].to_string();

        let mut params: Vec<UrlParameter> = Vec::new();
        for segment in uri.query().unwrap_or_default().split('&') {
            let Some((name, value)) = form_urlencoded::parse(segment.as_bytes()).next() else {
                continue;
            };
            if params.iter().any(|p| p.name == name) {
                continue;
            }
            let raw_name = segment.split_once('=').map_or(segment, |(n, _)| n);
            params.push(UrlParameter {
                name: name.into_owned(),
                value: value.into_owned(),
                raw_name: raw_name.to_string(),
                raw_segment: segment.to_string(),
            });
        }

        Ok(Self {
            uri,
            url_base,
            params,
            content: None,
        })
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn url_base(&self) -> &str {
        &self.url_base
    }

    pub fn params(&self) -> &[UrlParameter] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&UrlParameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Host the target lives on, used to key cumulative cookies
    pub fn host(&self) -> String {
        self.uri.host_str().unwrap_or_default().to_string()
    }

    /// Query string with `name` set to `value` and every other parameter untouched.
    ///
    /// `value` is sent as is apart from query delimiters (`%`, `&`, `#`, `+`),
    /// which are percent-encoded so the server decodes exactly `value`.
    pub fn get_param(&self, name: &str, value: &str) -> String {
        let value = encode_query_value(value);
        self.params
            .iter()
            .map(|p| {
                if p.name == name {
                    format!("{}={value}", p.raw_name)
                } else {
                    p.raw_segment.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Query string with every parameter set to `value`
    pub fn get_all_params(&self, value: &str) -> String {
        let value = encode_query_value(value);
        self.params
            .iter()
            .map(|p| format!("{}={value}", p.raw_name))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Full URL for a query string produced by [`get_param`](Self::get_param)
    /// or [`get_all_params`](Self::get_all_params)
    pub fn url_with_query(&self, query: &str) -> String {
        if query.is_empty() {
            self.url_base.clone()
        } else {
            format!("{}?{query}", self.url_base)
        }
    }
}

fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_DELIMITERS).to_string()
}
