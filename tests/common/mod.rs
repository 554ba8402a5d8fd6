//! Common test utilities: a scripted site, a fake browser that drives the
//! proxy hooks like the real listener does, and fake process plumbing

#![allow(dead_code)]

use async_trait::async_trait;
use halberd::browser::{Browser, BrowserLauncher, BrowserPool, BrowserType, ProcessControl};
use halberd::context::ScanContext;
use halberd::error::{HalberdError, Result};
use halberd::http::cookies::{cookie_header, merge_cookies};
use halberd::http::{Cookie, HttpHeaders};
use halberd::models::{BrowserAllocation, EngineConfig};
use halberd::proxy::{
    NullProxyCache, ProxyRequest, ProxyResponse, ProxyService, ProxySession, RequestInterceptor,
    ResponseObserver,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PAGE_ACCEPT: &str = "text/html,application/xhtml+xml,*/*;q=0.8";

/// Answers every request a fake browser sends, after the proxy hooks ran
pub type Site = Arc<dyn Fn(&ProxyRequest) -> ProxyResponse + Send + Sync>;

/// Every request a site saw, in arrival order
#[derive(Clone, Default)]
pub struct RequestLog {
    requests: Arc<Mutex<Vec<ProxyRequest>>>,
}

impl RequestLog {
    pub fn record(&self, request: &ProxyRequest) {
        self.requests.lock().push(request.clone());
    }

    pub fn requests(&self) -> Vec<ProxyRequest> {
        self.requests.lock().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.url.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }
}

pub fn html(status: u16, body: impl Into<String>) -> ProxyResponse {
    let headers: HttpHeaders = [("Content-Type", "text/html; charset=utf-8")]
        .into_iter()
        .collect();
    ProxyResponse::new(status, headers, body.into().into_bytes())
}

/// Query values of `url`, percent-decoded
pub fn query_values(url: &str) -> Vec<(String, String)> {
    url::Url::parse(url)
        .map(|u| {
            u.query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

/// A site that echoes every decoded query value into an HTML page
pub fn reflecting_site(log: RequestLog) -> Site {
    Arc::new(move |request: &ProxyRequest| {
        log.record(request);
        let echoed: Vec<String> = query_values(&request.url)
            .into_iter()
            .map(|(k, v)| format!("<p>{k}: {v}</p>"))
            .collect();
        html(
            200,
            format!(
                "<html><head><title>Echo</title></head><body>{}</body></html>",
                echoed.join("")
            ),
        )
    })
}

/// Browser that talks to a [`Site`] through the proxy hooks instead of a socket
pub struct FakeBrowser {
    process_id: u32,
    proxy: Arc<ProxyService>,
    site: Site,
    dead: Arc<Mutex<HashSet<u32>>>,
    cookies: Vec<Cookie>,
    page: Option<(String, String)>,
    closed: bool,
}

impl FakeBrowser {
    pub fn new(process_id: u32, proxy: Arc<ProxyService>, site: Site) -> Self {
        Self {
            process_id,
            proxy,
            site,
            dead: Arc::new(Mutex::new(HashSet::new())),
            cookies: Vec::new(),
            page: None,
            closed: false,
        }
    }

    fn body(&self) -> &str {
        self.page.as_ref().map(|(_, body)| body.as_str()).unwrap_or("")
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn navigate_to(&mut self, url: &str) -> Result<()> {
        if self.closed {
            return Err(HalberdError::BrowserError("closed".to_string()));
        }
        let mut headers: HttpHeaders = [("Accept", PAGE_ACCEPT), ("User-Agent", "FakeBrowser/1.0")]
            .into_iter()
            .collect();
        if !self.cookies.is_empty() {
            headers.set("Cookie", cookie_header(&self.cookies));
        }

        let mut session = ProxySession::new(self.process_id, "GET", url, headers);
        self.proxy.before_request(&mut session);
        if session.response.is_none() {
            session.response = Some((self.site)(&session.request));
        }
        self.proxy.before_response(&mut session);

        let response = session.response.unwrap_or_else(|| html(502, "Bad Gateway"));
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default();
        let fresh: Vec<Cookie> = response
            .headers
            .get_all("set-cookie")
            .into_iter()
            .filter_map(Cookie::parse_set_cookie)
            .map(|c| c.with_domain(host.clone()))
            .collect();
        merge_cookies(&mut self.cookies, fresh);

        self.page = Some((url.to_string(), response.body_text()));
        Ok(())
    }

    async fn wait_for_page_load(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(self.page.is_some())
    }

    async fn page_source(&mut self) -> Result<String> {
        Ok(self.body().to_string())
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self
            .page
            .as_ref()
            .map(|(url, _)| url.clone())
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&mut self) -> Result<String> {
        let body = self.body();
        let title = body
            .find("<title>")
            .and_then(|start| {
                let rest = &body[start + "<title>".len()..];
                rest.find("</title>").map(|end| rest[..end].to_string())
            })
            .unwrap_or_default();
        Ok(title)
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>> {
        Ok(self.cookies.clone())
    }

    async fn add_cookie(&mut self, cookie: &Cookie) -> Result<()> {
        merge_cookies(&mut self.cookies, vec![cookie.clone()]);
        Ok(())
    }

    async fn delete_all_cookies(&mut self) -> Result<()> {
        self.cookies.clear();
        Ok(())
    }

    async fn find_element(&mut self, selector: &str) -> Result<Option<String>> {
        Ok(self.body().contains(selector).then(|| selector.to_string()))
    }

    async fn quit(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        !self.closed && !self.dead.lock().contains(&self.process_id)
    }

    fn process_id(&self) -> u32 {
        self.process_id
    }

    fn parent_process_id(&self) -> u32 {
        1
    }

    fn user_agent(&self) -> &str {
        "FakeBrowser/1.0"
    }
}

/// Launches [`FakeBrowser`]s with sequential ids and can crash them on demand
pub struct FakeLauncher {
    proxy: Arc<ProxyService>,
    site: Site,
    next_id: AtomicU32,
    launched: AtomicUsize,
    dead: Arc<Mutex<HashSet<u32>>>,
}

impl FakeLauncher {
    pub fn new(proxy: Arc<ProxyService>, site: Site) -> Self {
        Self {
            proxy,
            site,
            next_id: AtomicU32::new(100),
            launched: AtomicUsize::new(0),
            dead: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Makes the browser with this id report itself as dead
    pub fn crash(&self, process_id: u32) {
        self.dead.lock().insert(process_id);
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, _browser_type: BrowserType, _proxy_port: u16) -> Result<Box<dyn Browser>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.launched.fetch_add(1, Ordering::SeqCst);
        let mut browser = FakeBrowser::new(id, Arc::clone(&self.proxy), Arc::clone(&self.site));
        browser.dead = Arc::clone(&self.dead);
        Ok(Box::new(browser))
    }
}

/// Process control that records kills and treats killed processes as exited
#[derive(Default)]
pub struct FakeProcessControl {
    killed: Mutex<Vec<u32>>,
}

impl FakeProcessControl {
    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().clone()
    }
}

#[async_trait]
impl ProcessControl for FakeProcessControl {
    fn has_exited(&self, process_id: u32) -> bool {
        self.killed.lock().contains(&process_id)
    }

    fn kill(&self, process_id: u32) -> Result<()> {
        self.killed.lock().push(process_id);
        Ok(())
    }

    async fn wait_for_exit(&self, process_id: u32, _timeout: Duration) -> bool {
        self.has_exited(process_id)
    }

    fn find_by_window_title(&self, _title: &str) -> Option<u32> {
        None
    }
}

/// Engine configuration with short timeouts and `browsers` HTTP browsers
pub fn test_config(browsers: usize) -> EngineConfig {
    EngineConfig {
        proxy_port: 0,
        user_agent: "Halberd-Test/0.1".to_string(),
        browsers: vec![BrowserAllocation {
            browser_type: BrowserType::Http,
            count: browsers,
        }],
        default_browser: BrowserType::Http,
        acquire_timeout_ms: 2_000,
        page_load_timeout_ms: 200,
        session_wait_ms: 200,
        cache_enabled: false,
        ..EngineConfig::default()
    }
}

/// Everything a scan needs, wired to fakes
pub struct Harness {
    pub config: EngineConfig,
    pub proxy: Arc<ProxyService>,
    pub pool: Arc<BrowserPool>,
    pub launcher: Arc<FakeLauncher>,
    pub processes: Arc<FakeProcessControl>,
}

impl Harness {
    pub async fn start(config: EngineConfig, site: Site) -> Self {
        let proxy = Arc::new(ProxyService::new(Arc::new(NullProxyCache)));
        proxy
            .initialize(&config.global_headers, 0)
            .await
            .expect("proxy hooks attach without a listener");
        Self::with_proxy(config, proxy, site).await
    }

    /// Uses `proxy` as given, attached or not
    pub async fn with_proxy(config: EngineConfig, proxy: Arc<ProxyService>, site: Site) -> Self {
        let launcher = Arc::new(FakeLauncher::new(Arc::clone(&proxy), site));
        let processes = Arc::new(FakeProcessControl::default());
        let pool = BrowserPool::new(
            &config,
            Arc::clone(&launcher) as Arc<dyn BrowserLauncher>,
            Arc::clone(&processes) as Arc<dyn ProcessControl>,
            Arc::clone(&proxy),
        );
        pool.create_browser_instances()
            .await
            .expect("fake browsers always launch");
        Self {
            config,
            proxy,
            pool: Arc::new(pool),
            launcher,
            processes,
        }
    }

    pub fn context(&self) -> Arc<ScanContext> {
        Arc::new(ScanContext::new(
            &self.config,
            Arc::clone(&self.pool),
            Arc::clone(&self.proxy),
        ))
    }
}
