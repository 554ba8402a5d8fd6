//! Headless Chromium backend
//!
//! Only available with the `browser` feature. Each instance is a separate
//! Chromium process started with `--proxy-server` pointing at the
//! intercepting proxy; every request it makes carries the instance header
//! through CDP extra headers so the proxy can correlate it.

use super::http_browser::HttpBrowserLauncher;
use super::{next_process_id, Browser, BrowserLauncher, BrowserType, INSTANCE_HEADER};
use crate::error::{HalberdError, Result};
use crate::http::Cookie;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    ClearBrowserCookiesParams, CookieParam, Headers, SetExtraHttpHeadersParams,
    SetUserAgentOverrideParams,
};
use chromiumoxide::{Browser as CdpBrowser, BrowserConfig, Page};
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READY_POLL: Duration = Duration::from_millis(100);

pub struct ChromiumBrowser {
    browser: CdpBrowser,
    page: Page,
    handler: JoinHandle<()>,
    process_id: u32,
    user_agent: String,
    closed: bool,
}

impl ChromiumBrowser {
    pub async fn launch(process_id: u32, user_agent: &str, proxy_port: u16) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--ignore-certificate-errors");
        if proxy_port != 0 {
            builder = builder
                .arg(format!("--proxy-server=http://127.0.0.1:{proxy_port}"))
                .arg("--proxy-bypass-list=<-loopback>");
        }
        let config = builder
            .build()
            .map_err(|e| HalberdError::BrowserError(format!("Browser config error: {e}")))?;

        let (browser, mut events) = CdpBrowser::launch(config)
            .await
            .map_err(|e| HalberdError::BrowserError(format!("Chromium failed to start: {e}")))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(cdp_error)?;

        let headers = serde_json::json!({ INSTANCE_HEADER: process_id.to_string() });
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await
            .map_err(cdp_error)?;
        page.execute(SetUserAgentOverrideParams::new(user_agent))
            .await
            .map_err(cdp_error)?;

        info!("Chromium instance {process_id} started");
        Ok(Self {
            browser,
            page,
            handler,
            process_id,
            user_agent: user_agent.to_string(),
            closed: false,
        })
    }
}

fn cdp_error(e: chromiumoxide::error::CdpError) -> HalberdError {
    HalberdError::BrowserError(e.to_string())
}

#[async_trait]
impl Browser for ChromiumBrowser {
    async fn navigate_to(&mut self, url: &str) -> Result<()> {
        if let Err(e) = self.page.goto(url).await {
            debug!("Chromium navigation to {url} failed: {e}");
        }
        Ok(())
    }

    /// `goto` already waits for the load event; this only confirms the
    /// document settled, polling `readyState` until `timeout`.
    async fn wait_for_page_load(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let state = match tokio::time::timeout(remaining, self.page.evaluate("document.readyState")).await {
                Ok(Ok(result)) => result.into_value::<String>().ok(),
                Ok(Err(e)) => {
                    debug!("Reading document state failed: {e}");
                    None
                }
                Err(_) => return Ok(false),
            };
            if state.as_deref() == Some("complete") {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn page_source(&mut self) -> Result<String> {
        self.page.content().await.map_err(cdp_error)
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await
            .map_err(cdp_error)?
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&mut self) -> Result<String> {
        Ok(self.page.get_title().await.map_err(cdp_error)?.unwrap_or_default())
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>> {
        let cookies = self.page.get_cookies().await.map_err(cdp_error)?;
        Ok(cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: Some(c.domain.trim_start_matches('.').to_string()),
                path: Some(c.path),
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect())
    }

    async fn add_cookie(&mut self, cookie: &Cookie) -> Result<()> {
        let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
        param.domain = cookie.domain.clone();
        param.path = Some(cookie.path.clone().unwrap_or_else(|| "/".to_string()));
        param.secure = Some(cookie.secure);
        param.http_only = Some(cookie.http_only);
        self.page.set_cookie(param).await.map_err(cdp_error)?;
        Ok(())
    }

    async fn delete_all_cookies(&mut self) -> Result<()> {
        self.page
            .execute(ClearBrowserCookiesParams::default())
            .await
            .map_err(cdp_error)?;
        Ok(())
    }

    async fn find_element(&mut self, selector: &str) -> Result<Option<String>> {
        match self.page.find_element(selector).await {
            Ok(element) => element.inner_text().await.map_err(cdp_error),
            Err(_) => Ok(None),
        }
    }

    async fn quit(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.browser.close().await {
            warn!("Chromium instance {} did not close: {e}", self.process_id);
        }
        if let Err(e) = self.browser.wait().await {
            debug!("Chromium instance {} exit status unknown: {e}", self.process_id);
        }
        self.handler.abort();
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        !self.closed && !self.handler.is_finished()
    }

    fn process_id(&self) -> u32 {
        self.process_id
    }

    fn parent_process_id(&self) -> u32 {
        std::process::id()
    }

    fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// Starts Chromium for the Chrome and Edge types and HTTP browsers otherwise
pub struct ChromiumLauncher {
    user_agent: String,
    fallback: HttpBrowserLauncher,
}

impl ChromiumLauncher {
    pub fn new(user_agent: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        Self {
            fallback: HttpBrowserLauncher::new(user_agent.clone()),
            user_agent,
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, browser_type: BrowserType, proxy_port: u16) -> Result<Box<dyn Browser>> {
        match browser_type {
            BrowserType::Chrome | BrowserType::Edge => {
                let process_id = next_process_id();
                let browser =
                    ChromiumBrowser::launch(process_id, &self.user_agent, proxy_port).await?;
                Ok(Box::new(browser))
            }
            _ => self.fallback.launch(browser_type, proxy_port).await,
        }
    }
}
