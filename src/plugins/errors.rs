//! Verbose error pages leaking stack traces and internals

use super::{snippet, Plugin, PluginDescriptor, PluginKind};
use crate::context::ResponseHolder;
use crate::models::{Severity, Vulnerability};
use crate::target::Target;
use regex::Regex;
use std::sync::OnceLock;

const ERROR_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)stack\s*trace:", "Stack trace"),
    (r"(?i)exception\s+in\s+thread", "Java exception"),
    (r"(?i)traceback\s*\(most\s+recent", "Python traceback"),
    (r"(?i)fatal\s+error.*on\s+line\s+\d+", "PHP fatal error"),
    (r"(?i)uncaught\s+exception", "Uncaught exception"),
    (r"(?i)server\s+error\s+in\s+'[^']*'\s+application", "ASP.NET error page"),
    (r"(?i)warning:.*\bon\s+line\s+\d+", "PHP warning with line number"),
    (r"(?i)\bat\s+[\w.]+\.\w+\([^)]*\)\s+in\s+\S+:line\s+\d+", ".NET stack frame"),
    (r"\bat\s+[\w$.]+\([\w]+\.java:\d+\)", "Java stack frame"),
];

pub struct ErrorPageDetector;

fn compiled() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        ERROR_PATTERNS
            .iter()
            .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|re| (re, *label)))
            .collect()
    })
}

/// First error signature in `body` with the surrounding text
pub fn find_error_signature(body: &str) -> Option<(&'static str, String)> {
    compiled().iter().find_map(|(re, label)| {
        re.find(body)
            .map(|m| (*label, snippet(body, m.start(), m.end(), 50)))
    })
}

impl Plugin for ErrorPageDetector {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "errors",
            description: "Verbose error pages exposing stack traces and framework internals",
            kind: PluginKind::Detector,
        }
    }

    fn inspect(&self, response: &ResponseHolder, _target: &Target) -> Vec<Vulnerability> {
        let Some((label, context)) = find_error_signature(response.body_text()) else {
            return Vec::new();
        };
        vec![Vulnerability::new(
            format!("Verbose Error Page ({label})"),
            Severity::Medium,
            "errors",
            &response.final_url,
        )
        .with_evidence(context)
        .with_response(response.snapshot())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_aspnet_and_python_errors() {
        let (label, _) =
            find_error_signature("<h1>Server Error in '/' Application.</h1>").unwrap();
        assert_eq!(label, "ASP.NET error page");

        let (label, context) = find_error_signature(
            "Traceback (most recent call last):\n  File \"app.py\", line 3",
        )
        .unwrap();
        assert_eq!(label, "Python traceback");
        assert!(context.contains("Traceback"));
    }

    #[test]
    fn test_java_frame() {
        let body = "java.lang.NullPointerException\n\tat com.shop.Cart.add(Cart.java:42)";
        assert_eq!(find_error_signature(body).unwrap().0, "Java stack frame");
    }

    #[test]
    fn test_clean_page() {
        assert!(find_error_signature("<html><body>Welcome</body></html>").is_none());
    }
}
