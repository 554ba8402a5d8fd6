//! Security header, CORS and version disclosure checks

use super::{Plugin, PluginDescriptor, PluginKind};
use crate::context::ResponseHolder;
use crate::models::{Severity, Vulnerability};
use crate::target::Target;
use tracing::debug;

pub struct HeadersDetector;

enum HeaderResult {
    Missing,
    Invalid(String),
    Weak(String),
    Ok,
}

fn validate_csp(value: Option<&str>) -> HeaderResult {
    match value {
        None => HeaderResult::Missing,
        Some(v) if v.contains("unsafe-inline") || v.contains("unsafe-eval") => {
            HeaderResult::Weak(format!("CSP contains unsafe directives: {v}"))
        }
        Some(_) => HeaderResult::Ok,
    }
}

fn validate_hsts(value: Option<&str>) -> HeaderResult {
    let Some(v) = value else {
        return HeaderResult::Missing;
    };
    let Some(max_age) = v
        .split(';')
        .find_map(|part| part.trim().strip_prefix("max-age="))
    else {
        return HeaderResult::Invalid("Missing max-age directive".to_string());
    };
    match max_age.trim().parse::<u64>() {
        Ok(age) if age < 31_536_000 => {
            HeaderResult::Weak(format!("HSTS max-age is {age} (should be >= 31536000)"))
        }
        Ok(_) => HeaderResult::Ok,
        Err(_) => HeaderResult::Invalid("Invalid max-age value".to_string()),
    }
}

fn validate_x_content_type(value: Option<&str>) -> HeaderResult {
    match value {
        None => HeaderResult::Missing,
        Some(v) if v.trim().eq_ignore_ascii_case("nosniff") => HeaderResult::Ok,
        Some(v) => HeaderResult::Invalid(format!("Expected 'nosniff', got '{v}'")),
    }
}

fn validate_x_frame_options(value: Option<&str>) -> HeaderResult {
    match value {
        None => HeaderResult::Missing,
        Some(v) => {
            let upper = v.trim().to_uppercase();
            if upper == "DENY" || upper == "SAMEORIGIN" {
                HeaderResult::Ok
            } else {
                HeaderResult::Weak(format!("Unexpected value: {v}"))
            }
        }
    }
}

struct HeaderCheck {
    name: &'static str,
    severity: Severity,
    https_only: bool,
    validator: fn(Option<&str>) -> HeaderResult,
}

const CHECKS: &[HeaderCheck] = &[
    HeaderCheck {
        name: "Content-Security-Policy",
        severity: Severity::Medium,
        https_only: false,
        validator: validate_csp,
    },
    HeaderCheck {
        name: "Strict-Transport-Security",
        severity: Severity::Medium,
        https_only: true,
        validator: validate_hsts,
    },
    HeaderCheck {
        name: "X-Content-Type-Options",
        severity: Severity::Low,
        https_only: false,
        validator: validate_x_content_type,
    },
    HeaderCheck {
        name: "X-Frame-Options",
        severity: Severity::Medium,
        https_only: false,
        validator: validate_x_frame_options,
    },
];

/// A version number in a Server / X-Powered-By value
fn reveals_version(value: &str) -> bool {
    value.chars().any(|c| c.is_ascii_digit())
}

impl HeadersDetector {
    fn security_headers(&self, response: &ResponseHolder, findings: &mut Vec<Vulnerability>) {
        let is_https = response.final_url.starts_with("https://");
        for check in CHECKS {
            if check.https_only && !is_https {
                continue;
            }
            let value = response.headers.get(check.name);
            let (title, evidence) = match (check.validator)(value) {
                HeaderResult::Missing => (
                    format!("Missing {} Header", check.name),
                    format!("Header '{}' was not found in the response", check.name),
                ),
                HeaderResult::Invalid(detail) | HeaderResult::Weak(detail) => {
                    (format!("Misconfigured {} Header", check.name), detail)
                }
                HeaderResult::Ok => continue,
            };
            findings.push(
                Vulnerability::new(title, check.severity, "headers", &response.final_url)
                    .with_evidence(evidence)
                    .with_response(response.snapshot()),
            );
        }
    }

    fn cors(&self, response: &ResponseHolder, findings: &mut Vec<Vulnerability>) {
        let Some(acao) = response.headers.get("access-control-allow-origin") else {
            return;
        };
        let acao = acao.trim();
        let allows_credentials = response
            .headers
            .contains_value("access-control-allow-credentials", "true");
        let origin = response.request_headers.get("origin");
        debug!("ACAO '{acao}' for origin {origin:?}");

        let evidence = format!(
            "Access-Control-Allow-Origin: {acao}\nAccess-Control-Allow-Credentials: {allows_credentials}"
        );
        if acao == "*" && allows_credentials {
            findings.push(
                Vulnerability::new(
                    "CORS Wildcard with Credentials",
                    Severity::Medium,
                    "headers",
                    &response.final_url,
                )
                .with_evidence(evidence)
                .with_response(response.snapshot()),
            );
        } else if acao.eq_ignore_ascii_case("null") {
            findings.push(
                Vulnerability::new(
                    "CORS Allows Null Origin",
                    Severity::High,
                    "headers",
                    &response.final_url,
                )
                .with_evidence(evidence)
                .with_response(response.snapshot()),
            );
        } else if origin.is_some_and(|o| o == acao && !same_origin(o, &response.final_url)) {
            let level = if allows_credentials {
                Severity::Critical
            } else {
                Severity::High
            };
            findings.push(
                Vulnerability::new(
                    "CORS Reflects Arbitrary Origin",
                    level,
                    "headers",
                    &response.final_url,
                )
                .with_evidence(evidence)
                .with_response(response.snapshot()),
            );
        }
    }

    fn disclosure(&self, response: &ResponseHolder, findings: &mut Vec<Vulnerability>) {
        for name in ["Server", "X-Powered-By", "X-AspNet-Version"] {
            let Some(value) = response.headers.get(name) else {
                continue;
            };
            if name == "Server" && !reveals_version(value) {
                continue;
            }
            findings.push(
                Vulnerability::new(
                    format!("{name} Header Information Disclosure"),
                    Severity::Low,
                    "headers",
                    &response.final_url,
                )
                .with_evidence(format!("{name}: {value}"))
                .with_response(response.snapshot()),
            );
        }
    }
}

fn same_origin(origin: &str, url: &str) -> bool {
    let Ok(url) = url::Url::parse(url) else {
        return false;
    };
    url.origin().ascii_serialization() == origin.trim_end_matches('/')
}

impl Plugin for HeadersDetector {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "headers",
            description: "Missing security headers, CORS misconfiguration and version disclosure",
            kind: PluginKind::Detector,
        }
    }

    fn inspect(&self, response: &ResponseHolder, _target: &Target) -> Vec<Vulnerability> {
        let mut findings = Vec::new();
        if response.status_code == 0 {
            return findings;
        }
        let is_page = response
            .content_type()
            .is_some_and(|ct| ct.to_lowercase().contains("text/html"));
        if is_page {
            self.security_headers(response, &mut findings);
        }
        self.cors(response, &mut findings);
        self.disclosure(response, &mut findings);
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validators() {
        assert!(matches!(validate_csp(None), HeaderResult::Missing));
        assert!(matches!(
            validate_csp(Some("script-src 'unsafe-inline'")),
            HeaderResult::Weak(_)
        ));
        assert!(matches!(validate_hsts(Some("max-age=100")), HeaderResult::Weak(_)));
        assert!(matches!(validate_hsts(Some("max-age=abc")), HeaderResult::Invalid(_)));
        assert!(matches!(validate_hsts(Some("max-age=31536000")), HeaderResult::Ok));
        assert!(matches!(validate_x_content_type(Some("NoSniff")), HeaderResult::Ok));
        assert!(matches!(validate_x_frame_options(Some("ALLOW-FROM x")), HeaderResult::Weak(_)));
    }

    #[test]
    fn test_same_origin() {
        assert!(same_origin("http://site.test", "http://site.test/a?b=1"));
        assert!(!same_origin("https://evil.test", "http://site.test/"));
    }

    #[test]
    fn test_reveals_version() {
        assert!(reveals_version("Apache/2.4.1"));
        assert!(!reveals_version("cloudflare"));
    }
}
