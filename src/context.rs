//! Request/response orchestration shared by every plugin
//!
//! [`ScanContext::send_request`] is the single round trip the plugins use:
//! lease a browser, prime its cookies, navigate, then pick up the session
//! the proxy published for (browser process, final URL). The browser stays
//! leased inside the returned [`ResponseHolder`] until
//! [`ScanContext::release`] hands it back.

use crate::browser::{BrowserInstance, BrowserPool, BrowserType};
use crate::engine::CancelToken;
use crate::error::{HalberdError, Result};
use crate::http::cookies::merge_cookies;
use crate::http::{Cookie, HttpHeaders};
use crate::models::{EngineConfig, ResponseSnapshot, Vulnerability};
use crate::plugins::Plugin;
use crate::proxy::ProxyService;
use crate::target::Target;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// What to request and how
#[derive(Debug, Clone)]
pub struct RequestParameters {
    pub url: String,
    pub browser_type: BrowserType,
    /// Cookies to send instead of the cumulative set for the host
    pub cookies: Option<Vec<Cookie>>,
    /// Content-Type registered with the proxy for this request only
    pub content_type: Option<String>,
    /// Fold the browser's cookies into the cumulative set afterwards
    pub save_cookies: bool,
}

impl RequestParameters {
    pub fn new(url: impl Into<String>, browser_type: BrowserType) -> Self {
        Self {
            url: url.into(),
            browser_type,
            cookies: None,
            content_type: None,
            save_cookies: true,
        }
    }

    pub fn with_cookies(mut self, cookies: Vec<Cookie>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn save_cookies(mut self, save: bool) -> Self {
        self.save_cookies = save;
        self
    }
}

/// Result of one round trip, holding the leased browser until released
#[derive(Debug)]
pub struct ResponseHolder {
    pub requested_url: String,
    pub final_url: String,
    /// 0 when the proxy published nothing for this navigation
    pub status_code: u16,
    pub headers: HttpHeaders,
    pub request_headers: HttpHeaders,
    pub body: Option<String>,
    pub user_agent: String,
    pub title: String,
    pub process_id: u32,
    browser: Option<BrowserInstance>,
}

impl ResponseHolder {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn has_body(&self) -> bool {
        self.body.as_deref().is_some_and(|b| !b.is_empty())
    }

    pub fn body_text(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }

    /// The leased browser, for multi-step flows on the same page
    pub fn browser(&mut self) -> Option<&mut BrowserInstance> {
        self.browser.as_mut()
    }

    pub fn snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            url: self.final_url.clone(),
            status_code: self.status_code,
            headers: self.headers.clone(),
            body: self.body.clone(),
            user_agent: self.user_agent.clone(),
            title: self.title.clone(),
        }
    }
}

/// Shared state of one scan: browser access, detectors, cookies and findings
pub struct ScanContext {
    pool: Arc<BrowserPool>,
    proxy: Arc<ProxyService>,
    default_browser: BrowserType,
    user_agent: String,
    instance_headers: String,
    page_load_timeout: Duration,
    session_wait: Duration,
    verbose: bool,
    cancel: CancelToken,
    detectors: RwLock<Vec<Arc<dyn Plugin>>>,
    vulnerabilities: Mutex<Vec<Vulnerability>>,
    current_cookies: RwLock<HashMap<String, Vec<Cookie>>>,
}

impl ScanContext {
    pub fn new(config: &EngineConfig, pool: Arc<BrowserPool>, proxy: Arc<ProxyService>) -> Self {
        Self {
            pool,
            proxy,
            default_browser: config.default_browser,
            user_agent: config.user_agent.clone(),
            instance_headers: config.instance_headers.clone(),
            page_load_timeout: config.page_load_timeout(),
            session_wait: config.session_wait(),
            verbose: false,
            cancel: CancelToken::new(),
            detectors: RwLock::new(Vec::new()),
            vulnerabilities: Mutex::new(Vec::new()),
            current_cookies: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn default_browser(&self) -> BrowserType {
        self.default_browser
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    /// Issues one request through a pooled browser.
    ///
    /// Navigation failures are data, not errors: the holder then carries
    /// whatever the browser shows. The browser is not released here.
    pub async fn send_request(&self, params: RequestParameters) -> Result<ResponseHolder> {
        if self.is_cancelled() {
            return Err(HalberdError::Cancelled);
        }

        let mut instance = self.pool.acquire_browser(params.browser_type).await?;
        match self.drive(&mut instance, &params).await {
            Ok(mut holder) => {
                holder.browser = Some(instance);
                Ok(holder)
            }
            Err(e) => {
                if let Err(release_err) = self.pool.release_browser(instance).await {
                    warn!("Failed to release browser after error: {release_err}");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        instance: &mut BrowserInstance,
        params: &RequestParameters,
    ) -> Result<ResponseHolder> {
        let process_id = instance.process_id();
        let host = host_of(&params.url);

        if let Some(content_type) = &params.content_type {
            let block = format!("{}\nContent-Type: {content_type}", self.instance_headers);
            self.proxy
                .register_instance_headers(process_id, Some(&self.user_agent), &block);
        }

        let cookies = match &params.cookies {
            Some(cookies) => cookies.clone(),
            None => self.current_cookies(&host).unwrap_or_default(),
        };
        let browser = instance.browser();
        browser.delete_all_cookies().await?;
        for cookie in &cookies {
            let mut cookie = cookie.clone();
            if cookie.domain.is_none() {
                cookie.domain = Some(host.clone());
            }
            browser.add_cookie(&cookie).await?;
        }

        self.log_request(format_args!("[{process_id}] GET {}", params.url));
        browser.navigate_to(&params.url).await?;
        if !browser.wait_for_page_load(self.page_load_timeout).await? {
            debug!("[{process_id}] page load timed out for {}", params.url);
        }

        let final_url = browser.current_url().await?;
        let title = browser.title().await.unwrap_or_default();

        let mut session = self
            .proxy
            .wait_for_session(process_id, &final_url, self.session_wait)
            .await;
        if session.is_none() && final_url != params.url {
            session = self.proxy.session(process_id, &params.url);
        }

        let mut holder = ResponseHolder {
            requested_url: params.url.clone(),
            final_url: final_url.clone(),
            status_code: 0,
            headers: HttpHeaders::new(),
            request_headers: HttpHeaders::new(),
            body: None,
            user_agent: instance.user_agent().to_string(),
            title,
            process_id,
            browser: None,
        };

        match session {
            Some(session) => {
                holder.request_headers = session.request.headers.clone();
                if let Some(response) = session.response {
                    holder.status_code = response.status;
                    holder.body = Some(response.body_text());
                    holder.headers = response.headers;
                }
            }
            None => {
                debug!("[{process_id}] no proxy session for {final_url}, using page state");
                holder.body = Some(instance.browser().page_source().await?);
            }
        }

        if params.save_cookies && !host.is_empty() {
            let fresh = instance.browser().cookies().await?;
            if !fresh.is_empty() {
                merge_cookies(
                    self.current_cookies.write().entry(host).or_default(),
                    fresh,
                );
            }
        }

        self.log_request(format_args!(
            "[{process_id}] {} {} ({} bytes)",
            holder.status_code,
            holder.final_url,
            holder.body.as_ref().map_or(0, String::len)
        ));
        Ok(holder)
    }

    /// Returns the browser held by `holder` to the pool
    pub async fn release(&self, mut holder: ResponseHolder) -> Result<()> {
        match holder.browser.take() {
            Some(instance) => self.pool.release_browser(instance).await,
            None => Ok(()),
        }
    }

    pub fn register_detector(&self, detector: Arc<dyn Plugin>) {
        self.detectors.write().push(detector);
    }

    pub fn detector_count(&self) -> usize {
        self.detectors.read().len()
    }

    /// Lets every registered detector inspect a response another plugin produced
    pub fn run_detectors(
        &self,
        response: &ResponseHolder,
        target: &Target,
        plugin_name: &str,
        test_name: &str,
        param: &str,
        value: &str,
    ) -> usize {
        let detectors: Vec<Arc<dyn Plugin>> = self.detectors.read().clone();
        let mut found = 0;
        for detector in detectors {
            let findings = detector.inspect(response, target);
            if !findings.is_empty() {
                debug!(
                    "{} flagged {} issue(s) in a response from {plugin_name}/{test_name} ({param}={value})",
                    detector.describe().name,
                    findings.len()
                );
            }
            found += findings.len();
            self.add_vulnerabilities(findings);
        }
        found
    }

    pub fn add_vulnerability(&self, vulnerability: Vulnerability) {
        info!(
            "[{}] {} at {} ({})",
            vulnerability.level, vulnerability.title, vulnerability.url, vulnerability.plugin
        );
        self.vulnerabilities.lock().push(vulnerability);
    }

    pub fn add_vulnerabilities(&self, vulnerabilities: Vec<Vulnerability>) {
        for vulnerability in vulnerabilities {
            self.add_vulnerability(vulnerability);
        }
    }

    pub fn vulnerabilities(&self) -> Vec<Vulnerability> {
        self.vulnerabilities.lock().clone()
    }

    pub fn vulnerability(&self, id: &str) -> Option<Vulnerability> {
        self.vulnerabilities.lock().iter().find(|v| v.id == id).cloned()
    }

    /// Drains the collected findings
    pub fn take_vulnerabilities(&self) -> Vec<Vulnerability> {
        std::mem::take(&mut *self.vulnerabilities.lock())
    }

    pub fn current_cookies(&self, host: &str) -> Option<Vec<Cookie>> {
        self.current_cookies.read().get(host).cloned()
    }

    pub fn set_current_cookies(&self, host: &str, cookies: Vec<Cookie>) {
        self.current_cookies.write().insert(host.to_string(), cookies);
    }

    fn log_request(&self, message: std::fmt::Arguments<'_>) {
        if self.verbose {
            info!("{message}");
        } else {
            debug!("{message}");
        }
    }
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_default()
}
