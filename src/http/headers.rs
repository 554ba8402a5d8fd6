//! Ordered header collection with case-insensitive lookups

use serde::{Deserialize, Serialize};
use std::fmt;

/// A list of HTTP header pairs.
///
/// Keys are not unique: multi-valued headers such as `Set-Cookie` are stored
/// as repeated entries. Lookups ignore ASCII case, but the case of a key is
/// kept as inserted so it goes out on the wire verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header without touching existing entries of the same key
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replaces every entry of `key` with a single entry carrying `value`.
    ///
    /// The first existing entry keeps its position but takes the new key
    /// spelling; when the key is absent the header is appended.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(first) => {
                self.entries[first] = (key.to_string(), value);
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= first || !k.eq_ignore_ascii_case(key);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Removes every entry of `key`, returning how many were dropped
    pub fn remove(&mut self, key: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        before - self.entries.len()
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values stored under `key`, in insertion order
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// True when some entry matches both key and value, ignoring case
    pub fn contains_value(&self, key: &str, value: &str) -> bool {
        self.entries
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case(key) && v.eq_ignore_ascii_case(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes to wire format: one `Key: Value` line per entry, CRLF terminated
    pub fn to_wire(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}: {v}\r\n"))
            .collect()
    }
}

impl fmt::Display for HttpHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            writeln!(f, "{k}: {v}")?;
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for HttpHeaders
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl From<&hyper::HeaderMap> for HttpHeaders {
    fn from(map: &hyper::HeaderMap) -> Self {
        map.iter()
            .map(|(k, v)| (k.as_str(), String::from_utf8_lossy(v.as_bytes()).to_string()))
            .collect()
    }
}

/// Parses a single `key:value` header string.
///
/// Only strings that split into exactly one key and one value are accepted;
/// anything else (no colon, several colons, empty key) yields `None`.
pub fn parse_header_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split(':');
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();
    if parts.next().is_some() || key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

/// Parses a newline-delimited block of `key:value` lines, skipping malformed ones
pub fn parse_header_block(block: &str) -> Vec<(String, String)> {
    block.lines().filter_map(parse_header_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        let mut headers = HttpHeaders::new();
        headers.add("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert!(headers.contains("CONTENT-TYPE"));
        assert!(headers.contains_value("content-type", "TEXT/HTML"));
        assert!(!headers.contains_value("content-type", "text/plain"));
    }

    #[test]
    fn test_multi_valued_headers() {
        let mut headers = HttpHeaders::new();
        headers.add("Set-Cookie", "a=1");
        headers.add("Set-Cookie", "b=2");
        assert_eq!(headers.get_all("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(headers.remove("SET-COOKIE"), 2);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_set_replaces_all_and_keeps_key_case() {
        let mut headers = HttpHeaders::new();
        headers.add("accept", "*/*");
        headers.add("Host", "example.com");
        headers.add("ACCEPT", "image/png");
        headers.set("Accept", "text/html");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.to_wire(), "Accept: text/html\r\nHost: example.com\r\n");
    }

    #[test]
    fn test_parse_header_line() {
        assert_eq!(
            parse_header_line("X-Test: yes"),
            Some(("X-Test".to_string(), "yes".to_string()))
        );
        assert_eq!(parse_header_line("no colon here"), None);
        assert_eq!(parse_header_line("Referer: http://a"), None);
        assert_eq!(parse_header_line(": value"), None);
    }

    #[test]
    fn test_parse_header_block_skips_bad_lines() {
        let parsed = parse_header_block("X-A:1\ngarbage\nX-B: 2\r\n");
        assert_eq!(
            parsed,
            vec![
                ("X-A".to_string(), "1".to_string()),
                ("X-B".to_string(), "2".to_string())
            ]
        );
    }
}
