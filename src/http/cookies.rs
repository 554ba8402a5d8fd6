//! Browser cookie model and `Set-Cookie` parsing

use serde::{Deserialize, Serialize};

/// A cookie as seen by a browser instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Parses the value of one `Set-Cookie` header
    pub fn parse_set_cookie(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim());
        for attr in parts {
            let attr = attr.trim();
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = Some(val.trim().trim_start_matches('.').to_string()),
                "path" => cookie.path = Some(val.trim().to_string()),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        Some(cookie)
    }
}

/// Renders cookies as a `Cookie` request header value
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Merges `fresh` into `existing` by cookie name; fresh values win
pub fn merge_cookies(existing: &mut Vec<Cookie>, fresh: Vec<Cookie>) {
    for cookie in fresh {
        match existing.iter_mut().find(|c| c.name == cookie.name) {
            Some(slot) => *slot = cookie,
            None => existing.push(cookie),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_cookie_attributes() {
        let cookie =
            Cookie::parse_set_cookie("SESSIONID=abc123; Path=/; Domain=.example.com; Secure; HttpOnly")
                .unwrap();
        assert_eq!(cookie.name, "SESSIONID");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert_eq!(cookie.path.as_deref(), Some("/"));
        assert!(cookie.secure);
        assert!(cookie.http_only);
    }

    #[test]
    fn test_parse_set_cookie_rejects_garbage() {
        assert!(Cookie::parse_set_cookie("novalue").is_none());
        assert!(Cookie::parse_set_cookie("=abc").is_none());
    }

    #[test]
    fn test_merge_and_header() {
        let mut jar = vec![Cookie::new("a", "1"), Cookie::new("b", "2")];
        merge_cookies(&mut jar, vec![Cookie::new("b", "3"), Cookie::new("c", "4")]);
        assert_eq!(cookie_header(&jar), "a=1; b=3; c=4");
    }
}
