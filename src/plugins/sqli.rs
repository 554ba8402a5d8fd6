//! Error-based SQL injection through query parameters and cookies

use super::{payload_set, ContentTypeFilter, CookieTransform, Plugin, PluginDescriptor, PluginKind, TestCase};
use crate::http::Cookie;
use crate::models::Severity;
use crate::payloads::PayloadSource;
use std::sync::Arc;

const DEFAULT_PAYLOADS: &[&str] = &[
    "'",
    "\"",
    "' OR '1'='1",
    "1' OR '1'='1' --",
    "' UNION SELECT NULL--",
];

const DEFAULT_NUMERIC_PAYLOADS: &[&str] = &[
    "1 AND 1=CONVERT(int,@@version)--",
    "1 AND 1=CAST(version() AS int)--",
    "1/0",
    "1)",
];

/// Database error signatures, one alternative per engine
const SQL_ERRORS: &[&str] = &[
    r"you have an error in your sql syntax",
    r"warning:.*mysql",
    r"unclosed quotation mark",
    r"microsoft sql server",
    r"microsoft ole db provider for",
    r"ora-\d{5}",
    r"postgresql.*error",
    r"pg_query\(\)",
    r"sqlite3?\.operationalerror",
    r"sqlite_error",
    r"sql syntax.*error",
    r"sqlstate\[",
    r"odbc.*driver",
    r"syntax error converting the \w+ value",
];

pub struct SqlInjectionPlugin;

/// Regex alternation of every known database error
pub fn sql_error_pattern() -> String {
    SQL_ERRORS
        .iter()
        .map(|p| format!("(?:{p})"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Appends the payload to the value of every known cookie
pub fn append_to_cookies() -> CookieTransform {
    Arc::new(|known: &[Cookie], payload: &str| {
        known
            .iter()
            .map(|c| {
                let mut injected = c.clone();
                injected.value = format!("{}{payload}", c.value);
                injected
            })
            .collect()
    })
}

impl Plugin for SqlInjectionPlugin {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "sqli",
            description: "Error-based SQL injection in query parameters and cookies",
            kind: PluginKind::Fuzzer,
        }
    }

    fn test_cases(&self, payloads: &dyn PayloadSource, use_full_payloads: bool) -> Vec<TestCase> {
        let pattern = sql_error_pattern();
        let skip_static = ContentTypeFilter::deny(&["image/", "text/css", "javascript", "font/"]);
        let quote_payloads = payload_set(payloads, "sqli", use_full_payloads, DEFAULT_PAYLOADS);

        vec![
            TestCase::new("sqli", "SQL Injection (error-based)", Severity::Critical)
                .with_injection_strings(quote_payloads.clone())
                .with_match_string(pattern.clone())
                .with_content_type_filter(skip_static.clone()),
            TestCase::new(
                "sqli_numeric",
                "SQL Injection in numeric parameter",
                Severity::Critical,
            )
            .with_injection_strings(payload_set(
                payloads,
                "sqli_numeric",
                use_full_payloads,
                DEFAULT_NUMERIC_PAYLOADS,
            ))
            .with_match_string(pattern.clone())
            .numeric_only()
            .with_content_type_filter(skip_static.clone()),
            TestCase::new("sqli_cookie", "SQL Injection via cookie", Severity::Critical)
                .with_injection_strings(quote_payloads)
                .with_match_string(pattern)
                .with_cookie_transform(append_to_cookies())
                .save_request_cookies(false)
                .with_content_type_filter(skip_static),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::PayloadStore;

    #[test]
    fn test_error_pattern_matches_known_engines() {
        let case = TestCase::new("t", "T", Severity::High).with_match_string(sql_error_pattern());
        for body in [
            "You have an error in your SQL syntax; check the manual",
            "Unclosed quotation mark after the character string ''.",
            "ORA-01756: quoted string not properly terminated",
            "SQLSTATE[42000]: Syntax error",
            "Microsoft OLE DB Provider for ODBC Drivers error '80040e14'",
        ] {
            assert!(case.find_match(body).is_some(), "no match for {body}");
        }
        assert!(case.find_match("<html>Welcome back</html>").is_none());
    }

    #[test]
    fn test_cookie_transform_appends_payload() {
        let transform = append_to_cookies();
        let known = vec![Cookie::new("sid", "abc"), Cookie::new("lang", "en")];
        let injected = transform(&known, "'");
        assert_eq!(injected[0].value, "abc'");
        assert_eq!(injected[1].value, "en'");
        assert_eq!(injected[1].name, "lang");
    }

    #[test]
    fn test_test_case_policies() {
        let cases = SqlInjectionPlugin.test_cases(&PayloadStore::default(), false);
        assert_eq!(cases.len(), 3);
        assert!(cases[1].fuzz_only_numeric_param);
        assert!(cases[2].cookie_transform.is_some());
        assert!(!cases[2].save_request_cookies);
        assert_eq!(cases[0].injection_strings.len(), DEFAULT_PAYLOADS.len());
    }
}
