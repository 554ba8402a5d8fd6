//! Core data models for the Halberd engine

use crate::browser::BrowserType;
use crate::http::HttpHeaders;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Severity level for a recorded vulnerability
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

/// Immutable copy of the response that evidences a vulnerability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub url: String,
    pub status_code: u16,
    pub headers: HttpHeaders,
    pub body: Option<String>,
    pub user_agent: String,
    pub title: String,
}

/// A finding recorded by a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    /// Unique identifier, used as the collection key
    pub id: String,
    pub title: String,
    pub level: Severity,
    /// Plugin that recorded the finding
    pub plugin: String,
    /// URL of the request that produced the evidence
    pub url: String,
    pub tested_param: String,
    pub tested_value: String,
    pub evidence: String,
    pub match_string: Option<String>,
    pub response: ResponseSnapshot,
    pub found_at: DateTime<Local>,
}

impl Vulnerability {
    pub fn new(
        title: impl Into<String>,
        level: Severity,
        plugin: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            level,
            plugin: plugin.into(),
            url: url.into(),
            tested_param: String::new(),
            tested_value: String::new(),
            evidence: String::new(),
            match_string: None,
            response: ResponseSnapshot::default(),
            found_at: Local::now(),
        }
    }

    /// Sets the fuzzed parameter and the value sent in it
    pub fn with_param(mut self, param: impl Into<String>, value: impl Into<String>) -> Self {
        self.tested_param = param.into();
        self.tested_value = value.into();
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    pub fn with_match_string(mut self, pattern: impl Into<String>) -> Self {
        self.match_string = Some(pattern.into());
        self
    }

    pub fn with_response(mut self, response: ResponseSnapshot) -> Self {
        self.response = response;
        self
    }
}

/// Number of browser instances to provision for one browser type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserAllocation {
    pub browser_type: BrowserType,
    pub count: usize,
}

/// Configuration for the scanning engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Port the intercepting proxy listens on (0 = pass-through, no listener)
    pub proxy_port: u16,
    /// `key:value` headers injected into every proxied request
    pub global_headers: Vec<String>,
    /// Newline-delimited `key:value` headers registered per browser instance
    pub instance_headers: String,
    /// User-Agent registered for every browser instance
    pub user_agent: String,
    /// Browser instances to provision, per type
    pub browsers: Vec<BrowserAllocation>,
    /// Browser type used for plugin requests
    pub default_browser: BrowserType,
    /// How long `acquire_browser` waits for an idle instance
    pub acquire_timeout_ms: u64,
    /// How long a navigation may take to finish loading
    pub page_load_timeout_ms: u64,
    /// How long to wait for the proxy to publish the correlated session
    pub session_wait_ms: u64,
    pub cache_enabled: bool,
    /// Cached sub-resources older than this are evicted (<= 0 disables the cache)
    pub cache_ttl_secs: i64,
    /// Directory holding one payload file per test name
    pub payload_dir: PathBuf,
    /// Optional `name,true|false` plugin activation list
    pub plugins_file: Option<PathBuf>,
}

impl EngineConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.page_load_timeout_ms)
    }

    pub fn session_wait(&self) -> Duration {
        Duration::from_millis(self.session_wait_ms)
    }

    /// Caching is active only when enabled with a positive TTL
    pub fn cache_active(&self) -> bool {
        self.cache_enabled && self.cache_ttl_secs > 0
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proxy_port: 8877,
            global_headers: Vec::new(),
            instance_headers: String::new(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Halberd/0.1"
                .to_string(),
            browsers: vec![BrowserAllocation {
                browser_type: BrowserType::Http,
                count: 4,
            }],
            default_browser: BrowserType::Http,
            acquire_timeout_ms: 30_000,
            page_load_timeout_ms: 15_000,
            session_wait_ms: 5_000,
            cache_enabled: true,
            cache_ttl_secs: 300,
            payload_dir: PathBuf::from("payloads"),
            plugins_file: None,
        }
    }
}
