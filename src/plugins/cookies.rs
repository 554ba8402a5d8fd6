//! Cookie flag analysis

use super::{Plugin, PluginDescriptor, PluginKind};
use crate::context::ResponseHolder;
use crate::http::Cookie;
use crate::models::{Severity, Vulnerability};
use crate::target::Target;

pub struct CookiesDetector;

fn is_session_cookie(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["session", "sid", "token", "auth"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Issues with one `Set-Cookie` value as (title, severity)
fn cookie_issues(set_cookie: &str, is_https: bool) -> Vec<(String, Severity)> {
    let Some(cookie) = Cookie::parse_set_cookie(set_cookie) else {
        return Vec::new();
    };
    let lower = set_cookie.to_lowercase();
    let severity = if is_session_cookie(&cookie.name) {
        Severity::High
    } else {
        Severity::Medium
    };
    let name = &cookie.name;
    let mut issues = Vec::new();

    if is_https && !cookie.secure {
        issues.push((format!("Cookie '{name}' Missing Secure Flag"), severity));
    }
    if !cookie.http_only {
        issues.push((format!("Cookie '{name}' Missing HttpOnly Flag"), severity));
    }
    if !lower.contains("samesite") {
        issues.push((
            format!("Cookie '{name}' Missing SameSite Attribute"),
            Severity::Medium,
        ));
    } else if lower.contains("samesite=none") && !cookie.secure {
        issues.push((
            format!("Cookie '{name}' SameSite=None Without Secure"),
            Severity::Medium,
        ));
    }
    issues
}

impl Plugin for CookiesDetector {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "cookies",
            description: "Set-Cookie headers missing Secure, HttpOnly or SameSite",
            kind: PluginKind::Detector,
        }
    }

    fn inspect(&self, response: &ResponseHolder, _target: &Target) -> Vec<Vulnerability> {
        let is_https = response.final_url.starts_with("https://");
        response
            .headers
            .get_all("set-cookie")
            .into_iter()
            .flat_map(|set_cookie| {
                cookie_issues(set_cookie, is_https)
                    .into_iter()
                    .map(move |(title, level)| (title, level, set_cookie))
            })
            .map(|(title, level, set_cookie)| {
                Vulnerability::new(title, level, "cookies", &response.final_url)
                    .with_evidence(format!("Set-Cookie: {set_cookie}"))
                    .with_response(response.snapshot())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_missing_on_plain_cookie() {
        let issues = cookie_issues("sessionid=abc; Path=/", true);
        assert_eq!(issues.len(), 3);
        assert_eq!(issues[0].1, Severity::High);
        assert_eq!(issues[2].1, Severity::Medium);
        assert!(issues[0].0.contains("Secure"));
    }

    #[test]
    fn test_secure_flag_only_checked_over_https() {
        let issues = cookie_issues("lang=en; HttpOnly; SameSite=Lax", false);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_samesite_none_without_secure() {
        let issues = cookie_issues("id=1; HttpOnly; SameSite=None", false);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].0.contains("SameSite=None"));
    }

    #[test]
    fn test_hardened_cookie_is_clean() {
        assert!(cookie_issues("sid=x; Secure; HttpOnly; SameSite=Strict", true).is_empty());
        assert!(cookie_issues("garbage", true).is_empty());
    }
}
