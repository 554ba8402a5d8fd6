//! Browser capability and pooled browser instances
//!
//! The engine only talks to browsers through the [`Browser`] trait. Two
//! backends ship with the crate: [`http_browser::HttpBrowser`], a headless
//! HTTP-only client that is always available, and a Chromium backend behind
//! the `browser` feature.

#[cfg(feature = "browser")]
pub mod chromium;
pub mod http_browser;
pub mod pool;
pub mod process;

pub use pool::BrowserPool;
pub use process::{DetachedProcesses, ProcessControl};

use crate::error::{HalberdError, Result};
use crate::http::Cookie;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Request header carrying the browser instance id through the proxy
pub const INSTANCE_HEADER: &str = "X-Halberd-Instance";

/// Logical browser families the pool can provision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    Chrome,
    Firefox,
    Edge,
    /// Lightweight HTTP-only browser without script execution
    Http,
}

impl fmt::Display for BrowserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserType::Chrome => write!(f, "chrome"),
            BrowserType::Firefox => write!(f, "firefox"),
            BrowserType::Edge => write!(f, "edge"),
            BrowserType::Http => write!(f, "http"),
        }
    }
}

impl FromStr for BrowserType {
    type Err = HalberdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "chrome" | "chromium" => Ok(BrowserType::Chrome),
            "firefox" => Ok(BrowserType::Firefox),
            "edge" => Ok(BrowserType::Edge),
            "http" => Ok(BrowserType::Http),
            other => Err(HalberdError::ConfigError(format!(
                "Unknown browser type '{other}'"
            ))),
        }
    }
}

/// What the engine needs from a browser, independent of the automation technology
#[async_trait]
pub trait Browser: Send + Sync {
    /// Navigates to `url`. Network failures surface as error pages, not errors.
    async fn navigate_to(&mut self, url: &str) -> Result<()>;

    /// Waits until the current page finished loading; false on timeout
    async fn wait_for_page_load(&mut self, timeout: Duration) -> Result<bool>;

    async fn page_source(&mut self) -> Result<String>;

    /// URL of the current page after redirects
    async fn current_url(&mut self) -> Result<String>;

    async fn title(&mut self) -> Result<String>;

    async fn cookies(&mut self) -> Result<Vec<Cookie>>;

    async fn add_cookie(&mut self, cookie: &Cookie) -> Result<()>;

    async fn delete_all_cookies(&mut self) -> Result<()>;

    /// Text content of the first element matching a CSS selector
    async fn find_element(&mut self, selector: &str) -> Result<Option<String>>;

    /// Shuts the browser down
    async fn quit(&mut self) -> Result<()>;

    /// False once the underlying browser crashed or was closed
    async fn is_alive(&mut self) -> bool {
        true
    }

    fn process_id(&self) -> u32;

    fn parent_process_id(&self) -> u32;

    fn user_agent(&self) -> &str;
}

/// Starts browsers configured to route their traffic through the proxy
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, browser_type: BrowserType, proxy_port: u16) -> Result<Box<dyn Browser>>;
}

static NEXT_PROCESS_ID: AtomicU32 = AtomicU32::new(1);

/// Logical process id unique across every launcher in this process
pub fn next_process_id() -> u32 {
    NEXT_PROCESS_ID.fetch_add(1, Ordering::SeqCst)
}

/// A browser owned by the pool, or by exactly one caller while leased
pub struct BrowserInstance {
    browser: Box<dyn Browser>,
    browser_type: BrowserType,
    process_id: u32,
    parent_process_id: u32,
}

impl BrowserInstance {
    pub fn new(browser: Box<dyn Browser>, browser_type: BrowserType) -> Self {
        let process_id = browser.process_id();
        let parent_process_id = browser.parent_process_id();
        Self {
            browser,
            browser_type,
            process_id,
            parent_process_id,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn parent_process_id(&self) -> u32 {
        self.parent_process_id
    }

    pub fn browser_type(&self) -> BrowserType {
        self.browser_type
    }

    pub fn browser(&mut self) -> &mut dyn Browser {
        self.browser.as_mut()
    }

    pub fn user_agent(&self) -> &str {
        self.browser.user_agent()
    }
}

impl fmt::Debug for BrowserInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserInstance")
            .field("browser_type", &self.browser_type)
            .field("process_id", &self.process_id)
            .field("parent_process_id", &self.parent_process_id)
            .finish()
    }
}
