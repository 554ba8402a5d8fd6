//! Test and detector plugins
//!
//! A fuzzer plugin contributes [`TestCase`]s that the [`FuzzingEngine`]
//! drives through the [`ScanContext`]; a detector plugin only inspects
//! responses other plugins produced. Plugins are discovered through the
//! explicit [`registry`].

pub mod cookies;
pub mod errors;
pub mod headers;
pub mod sqli;
pub mod xss;

use crate::context::{RequestParameters, ResponseHolder, ScanContext};
use crate::error::{HalberdError, Result};
use crate::http::Cookie;
use crate::models::{Severity, Vulnerability};
use crate::payloads::PayloadSource;
use crate::target::Target;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Name given to the pseudo-parameter of an all-parameters request
pub const ALL_PARAMS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PluginKind {
    /// Issues its own fuzzed requests
    Fuzzer,
    /// Only inspects responses produced by others
    Detector,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Fuzzer => write!(f, "fuzzer"),
            PluginKind::Detector => write!(f, "detector"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: PluginKind,
}

/// Produces the cookies to send from the known ones and the current payload
pub type CookieTransform = Arc<dyn Fn(&[Cookie], &str) -> Vec<Cookie> + Send + Sync>;

/// Which response content types are worth inspecting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ContentTypeFilter {
    #[default]
    Any,
    /// Only content types containing one of these fragments
    Allow(Vec<String>),
    /// Every content type except those containing one of these fragments
    Deny(Vec<String>),
}

impl ContentTypeFilter {
    pub fn allow(fragments: &[&str]) -> Self {
        Self::Allow(fragments.iter().map(|f| f.to_lowercase()).collect())
    }

    pub fn deny(fragments: &[&str]) -> Self {
        Self::Deny(fragments.iter().map(|f| f.to_lowercase()).collect())
    }

    pub fn permits(&self, content_type: Option<&str>) -> bool {
        let content_type = content_type.unwrap_or("").to_lowercase();
        match self {
            ContentTypeFilter::Any => true,
            ContentTypeFilter::Allow(allowed) => {
                allowed.iter().any(|f| content_type.contains(f.as_str()))
            }
            ContentTypeFilter::Deny(denied) => {
                !denied.iter().any(|f| content_type.contains(f.as_str()))
            }
        }
    }
}

/// A named payload set with its match pattern and fuzzing policy
#[derive(Clone)]
pub struct TestCase {
    pub test_name: String,
    /// Title of the vulnerabilities this test case records
    pub title: String,
    pub severity: Severity,
    pub injection_strings: Vec<String>,
    match_string: Option<String>,
    matcher: Option<Regex>,
    /// Content-Type sent with every request of this test case
    pub content_type: Option<String>,
    pub fuzz_only_numeric_param: bool,
    pub fuzz_also_all_params_at_the_same_time: bool,
    pub save_request_cookies: bool,
    pub cookie_transform: Option<CookieTransform>,
    pub content_type_filter: ContentTypeFilter,
}

impl TestCase {
    pub fn new(test_name: impl Into<String>, title: impl Into<String>, severity: Severity) -> Self {
        Self {
            test_name: test_name.into(),
            title: title.into(),
            severity,
            injection_strings: Vec::new(),
            match_string: None,
            matcher: None,
            content_type: None,
            fuzz_only_numeric_param: false,
            fuzz_also_all_params_at_the_same_time: false,
            save_request_cookies: true,
            cookie_transform: None,
            content_type_filter: ContentTypeFilter::Any,
        }
    }

    pub fn with_injection_strings(mut self, injection_strings: Vec<String>) -> Self {
        self.injection_strings = injection_strings;
        self
    }

    /// Sets the pattern searched for in response bodies, case-insensitively.
    /// A pattern that is not a valid regular expression is matched literally.
    pub fn with_match_string(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let matcher = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .or_else(|e| {
                debug!("Match string '{pattern}' is not a regex ({e}), matching literally");
                RegexBuilder::new(&regex::escape(&pattern))
                    .case_insensitive(true)
                    .build()
            })
            .ok();
        self.match_string = Some(pattern);
        self.matcher = matcher;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn numeric_only(mut self) -> Self {
        self.fuzz_only_numeric_param = true;
        self
    }

    pub fn all_params_at_once(mut self) -> Self {
        self.fuzz_also_all_params_at_the_same_time = true;
        self
    }

    pub fn save_request_cookies(mut self, save: bool) -> Self {
        self.save_request_cookies = save;
        self
    }

    pub fn with_cookie_transform(mut self, transform: CookieTransform) -> Self {
        self.cookie_transform = Some(transform);
        self
    }

    pub fn with_content_type_filter(mut self, filter: ContentTypeFilter) -> Self {
        self.content_type_filter = filter;
        self
    }

    pub fn match_string(&self) -> Option<&str> {
        self.match_string.as_deref()
    }

    /// First match of the pattern in `body` as a byte range
    pub fn find_match(&self, body: &str) -> Option<(usize, usize)> {
        self.matcher
            .as_ref()
            .and_then(|re| re.find(body))
            .map(|m| (m.start(), m.end()))
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("test_name", &self.test_name)
            .field("injection_strings", &self.injection_strings.len())
            .field("match_string", &self.match_string)
            .field("fuzz_only_numeric_param", &self.fuzz_only_numeric_param)
            .field(
                "fuzz_also_all_params_at_the_same_time",
                &self.fuzz_also_all_params_at_the_same_time,
            )
            .field("cookie_transform", &self.cookie_transform.is_some())
            .field("content_type_filter", &self.content_type_filter)
            .finish()
    }
}

/// Trait every plugin implements
pub trait Plugin: Send + Sync {
    fn describe(&self) -> PluginDescriptor;

    /// Test cases this plugin fuzzes with; detectors have none
    fn test_cases(&self, _payloads: &dyn PayloadSource, _use_full_payloads: bool) -> Vec<TestCase> {
        Vec::new()
    }

    /// Inspects the response to one of this plugin's own requests
    fn check_for_vulnerabilities(
        &self,
        response: &ResponseHolder,
        test_case: &TestCase,
        param: &str,
        value: &str,
    ) -> Option<Vulnerability> {
        match_response(self.describe().name, response, test_case, param, value)
    }

    /// Inspects a response produced by any plugin
    fn inspect(&self, _response: &ResponseHolder, _target: &Target) -> Vec<Vulnerability> {
        Vec::new()
    }
}

/// Records one vulnerability when the test case pattern occurs in the body.
///
/// A test case without a match string never matches.
pub fn match_response(
    plugin: &str,
    response: &ResponseHolder,
    test_case: &TestCase,
    param: &str,
    value: &str,
) -> Option<Vulnerability> {
    let pattern = test_case.match_string()?;
    let body = response.body.as_deref()?;
    let (start, end) = test_case.find_match(body)?;

    Some(
        Vulnerability::new(
            test_case.title.clone(),
            test_case.severity,
            plugin,
            response.requested_url.clone(),
        )
        .with_param(param, value)
        .with_evidence(snippet(body, start, end, 60))
        .with_match_string(pattern)
        .with_response(response.snapshot()),
    )
}

/// `text[start..end]` widened by `context` bytes on both sides, on char boundaries
pub fn snippet(text: &str, start: usize, end: usize, context: usize) -> String {
    let mut from = start.saturating_sub(context);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = end.saturating_add(context).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }
    text[from..to].to_string()
}

/// Loads a payload set, preferring `<name>_full` when asked and available,
/// falling back to built-in defaults when the store has neither
pub fn payload_set(
    payloads: &dyn PayloadSource,
    name: &str,
    use_full_payloads: bool,
    defaults: &[&str],
) -> Vec<String> {
    let full_name = format!("{name}_full");
    if use_full_payloads {
        if let Ok(full) = payloads.load_payloads(&full_name) {
            return full.to_vec();
        }
    }
    match payloads.load_payloads(name) {
        Ok(set) => set.to_vec(),
        Err(_) => {
            debug!("No '{name}' payload set, using {} built-in payload(s)", defaults.len());
            defaults.iter().map(|s| s.to_string()).collect()
        }
    }
}

/// Every plugin shipped with the crate
pub fn registry() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(xss::XssPlugin),
        Arc::new(sqli::SqlInjectionPlugin),
        Arc::new(headers::HeadersDetector),
        Arc::new(cookies::CookiesDetector),
        Arc::new(errors::ErrorPageDetector),
    ]
}

pub fn find_plugin(name: &str) -> Option<Arc<dyn Plugin>> {
    registry()
        .into_iter()
        .find(|p| p.describe().name.eq_ignore_ascii_case(name.trim()))
}

/// Whether a parameter value reads as a number
pub fn is_numeric(value: &str) -> bool {
    value
        .trim()
        .parse::<f64>()
        .map(|n| n.is_finite())
        .unwrap_or(false)
}

/// Counters from one `do_tests` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuzzStats {
    pub requests: usize,
    pub inspected: usize,
    pub findings: usize,
}

/// Drives a plugin's test cases against one target
pub struct FuzzingEngine {
    context: Arc<ScanContext>,
    target: Target,
    plugin: Arc<dyn Plugin>,
    test_cases: Vec<TestCase>,
}

impl FuzzingEngine {
    pub fn init(
        context: Arc<ScanContext>,
        target: Target,
        plugin: Arc<dyn Plugin>,
        test_cases: Vec<TestCase>,
    ) -> Self {
        Self {
            context,
            target,
            plugin,
            test_cases,
        }
    }

    pub fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }

    /// Runs every test case in declared order.
    ///
    /// The first failure stops this plugin; it is logged, never returned.
    pub async fn do_tests(&self) -> FuzzStats {
        let name = self.plugin.describe().name;
        let mut stats = FuzzStats::default();
        match self.run(&mut stats).await {
            Ok(()) => debug!(
                "{name}: {} request(s), {} finding(s) on {}",
                stats.requests,
                stats.findings,
                self.target.uri()
            ),
            Err(HalberdError::Cancelled) => info!("{name}: cancelled after {} request(s)", stats.requests),
            Err(e) => error!("{name}: aborted on {}: {e}", self.target.uri()),
        }
        stats
    }

    async fn run(&self, stats: &mut FuzzStats) -> Result<()> {
        for test_case in &self.test_cases {
            for injection in &test_case.injection_strings {
                for param in self.target.params() {
                    if test_case.fuzz_only_numeric_param && !is_numeric(&param.value) {
                        continue;
                    }
                    let url = self
                        .target
                        .url_with_query(&self.target.get_param(&param.name, injection));
                    self.fuzz(test_case, &url, &param.name, injection, stats)
                        .await?;
                }

                if test_case.fuzz_also_all_params_at_the_same_time && !self.target.params().is_empty()
                {
                    let url = self
                        .target
                        .url_with_query(&self.target.get_all_params(injection));
                    self.fuzz(test_case, &url, ALL_PARAMS, injection, stats)
                        .await?;
                }

                // cookie fuzzing still runs against targets without parameters
                if test_case.cookie_transform.is_some() && self.target.params().is_empty() {
                    let url = self.target.uri().to_string();
                    self.fuzz(test_case, &url, "Cookie", injection, stats).await?;
                }
            }
        }
        Ok(())
    }

    async fn fuzz(
        &self,
        test_case: &TestCase,
        url: &str,
        param: &str,
        value: &str,
        stats: &mut FuzzStats,
    ) -> Result<()> {
        if self.context.is_cancelled() {
            return Err(HalberdError::Cancelled);
        }

        let mut params = RequestParameters::new(url, self.context.default_browser())
            .save_cookies(test_case.save_request_cookies);
        if let Some(content_type) = &test_case.content_type {
            params = params.with_content_type(content_type.clone());
        }
        if let Some(transform) = &test_case.cookie_transform {
            if let Some(known) = self
                .context
                .current_cookies(&self.target.host())
                .filter(|c| !c.is_empty())
            {
                params = params.with_cookies(transform(&known, value));
            }
        }

        let response = self.context.send_request(params).await?;
        stats.requests += 1;

        if response.has_body() && test_case.content_type_filter.permits(response.content_type()) {
            stats.inspected += 1;
            let name = self.plugin.describe().name;
            stats.findings += self.context.run_detectors(
                &response,
                &self.target,
                name,
                &test_case.test_name,
                param,
                value,
            );
            if let Some(vulnerability) = self
                .plugin
                .check_for_vulnerabilities(&response, test_case, param, value)
            {
                stats.findings += 1;
                self.context.add_vulnerability(vulnerability);
            }
        }

        self.context.release(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::PayloadStore;

    #[test]
    fn test_content_type_filter() {
        assert!(ContentTypeFilter::Any.permits(None));
        let allow = ContentTypeFilter::allow(&["text/html"]);
        assert!(allow.permits(Some("Text/HTML; charset=utf-8")));
        assert!(!allow.permits(Some("image/png")));
        assert!(!allow.permits(None));
        let deny = ContentTypeFilter::deny(&["image/"]);
        assert!(deny.permits(None));
        assert!(!deny.permits(Some("image/gif")));
    }

    #[test]
    fn test_match_string_is_case_insensitive() {
        let case = TestCase::new("t", "T", Severity::High).with_match_string("<SCRIPT>alert");
        assert!(case.find_match("..<script>ALERT(1)..").is_some());
        assert!(case.find_match("nothing here").is_none());
    }

    #[test]
    fn test_invalid_regex_matches_literally() {
        let case = TestCase::new("t", "T", Severity::Low).with_match_string("alert((");
        assert_eq!(case.find_match("x alert(( y"), Some((2, 9)));
        assert!(case.find_match("alert(1)").is_none());
    }

    #[test]
    fn test_no_match_string_never_matches() {
        let case = TestCase::new("t", "T", Severity::Low);
        assert!(case.match_string().is_none());
        assert!(case.find_match("anything").is_none());
    }

    #[test]
    fn test_is_numeric() {
        assert!(is_numeric("42"));
        assert!(is_numeric(" -3.5 "));
        assert!(!is_numeric("abc"));
        assert!(!is_numeric(""));
        assert!(!is_numeric("inf"));
        assert!(!is_numeric("NaN"));
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        let text = "ééé<script>ééé";
        let start = text.find('<').unwrap();
        let end = start + "<script>".len();
        let s = snippet(text, start, end, 1);
        assert!(s.contains("<script>"));
        assert_eq!(snippet("abc", 1, 2, 10), "abc");
    }

    #[test]
    fn test_payload_set_prefers_full_variant() {
        let store = PayloadStore::from_sets([
            ("xss", vec!["short"]),
            ("xss_full", vec!["long1", "long2"]),
        ]);
        assert_eq!(payload_set(&store, "xss", false, &[]), vec!["short"]);
        assert_eq!(payload_set(&store, "xss", true, &[]), vec!["long1", "long2"]);
        assert_eq!(payload_set(&store, "sqli", true, &["'"]), vec!["'"]);
    }

    #[test]
    fn test_registry_names_are_unique() {
        let mut names: Vec<&str> = registry().iter().map(|p| p.describe().name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(find_plugin("XSS").is_some());
        assert!(find_plugin("nope").is_none());
    }
}
