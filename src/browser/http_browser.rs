//! Headless HTTP-only browser
//!
//! Fetches pages with `reqwest` through the intercepting proxy, keeps a cookie
//! jar and answers DOM queries with `scraper`. It runs no JavaScript, which is
//! enough for reflected-input and header checks and needs no external binary.

use super::{next_process_id, Browser, BrowserLauncher, BrowserType, INSTANCE_HEADER};
use crate::error::{HalberdError, Result};
use crate::http::Cookie;
use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

const NAVIGATION_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone)]
struct LoadedPage {
    url: String,
    body: String,
}

pub struct HttpBrowser {
    process_id: u32,
    parent_process_id: u32,
    user_agent: String,
    proxy_port: u16,
    jar: Arc<Jar>,
    client: reqwest::Client,
    page: Option<LoadedPage>,
    closed: bool,
}

impl HttpBrowser {
    pub fn new(process_id: u32, user_agent: &str, proxy_port: u16) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = Self::build_client(process_id, user_agent, proxy_port, Arc::clone(&jar))?;
        Ok(Self {
            process_id,
            parent_process_id: std::process::id(),
            user_agent: user_agent.to_string(),
            proxy_port,
            jar,
            client,
            page: None,
            closed: false,
        })
    }

    fn build_client(
        process_id: u32,
        user_agent: &str,
        proxy_port: u16,
        jar: Arc<Jar>,
    ) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(NAVIGATION_ACCEPT));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(INSTANCE_HEADER, HeaderValue::from(process_id));

        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .cookie_provider(jar)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(NAVIGATION_TIMEOUT);

        builder = if proxy_port != 0 {
            builder.proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{proxy_port}"))?)
        } else {
            builder.no_proxy()
        };
        Ok(builder.build()?)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(HalberdError::BrowserError(format!(
                "browser {} was closed",
                self.process_id
            )));
        }
        Ok(())
    }

    fn body(&self) -> &str {
        self.page.as_ref().map(|p| p.body.as_str()).unwrap_or("")
    }
}

/// Text of the first element matching `selector`
fn select_text(html: &str, selector: &str) -> Result<Option<String>> {
    let selector = Selector::parse(selector)
        .map_err(|e| HalberdError::BrowserError(format!("Invalid selector '{selector}': {e}")))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string()))
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn navigate_to(&mut self, url: &str) -> Result<()> {
        self.ensure_open()?;
        let page = match self.client.get(url).send().await {
            Ok(resp) => {
                let final_url = resp.url().to_string();
                let body = resp.text().await.unwrap_or_default();
                LoadedPage {
                    url: final_url,
                    body,
                }
            }
            Err(e) => {
                debug!("Navigation to {url} failed: {e}");
                LoadedPage {
                    url: url.to_string(),
                    body: format!(
                        "<html><head><title>Navigation failed</title></head><body>{e}</body></html>"
                    ),
                }
            }
        };
        self.page = Some(page);
        Ok(())
    }

    async fn wait_for_page_load(&mut self, _timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.page.is_some())
    }

    async fn page_source(&mut self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.body().to_string())
    }

    async fn current_url(&mut self) -> Result<String> {
        self.ensure_open()?;
        Ok(self
            .page
            .as_ref()
            .map(|p| p.url.clone())
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&mut self) -> Result<String> {
        self.ensure_open()?;
        Ok(select_text(self.body(), "title")?.unwrap_or_default())
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>> {
        self.ensure_open()?;
        let Some(url) = self.page.as_ref().and_then(|p| Url::parse(&p.url).ok()) else {
            return Ok(Vec::new());
        };
        let host = url.host_str().unwrap_or_default().to_string();
        let cookies = self
            .jar
            .cookies(&url)
            .and_then(|v| v.to_str().ok().map(String::from))
            .map(|header| {
                header
                    .split(';')
                    .filter_map(|pair| pair.trim().split_once('='))
                    .map(|(name, value)| Cookie::new(name, value).with_domain(host.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(cookies)
    }

    async fn add_cookie(&mut self, cookie: &Cookie) -> Result<()> {
        self.ensure_open()?;
        let domain = cookie
            .domain
            .clone()
            .or_else(|| {
                self.page
                    .as_ref()
                    .and_then(|p| Url::parse(&p.url).ok())
                    .and_then(|u| u.host_str().map(String::from))
            })
            .ok_or_else(|| {
                HalberdError::BrowserError(format!("cookie '{}' has no domain", cookie.name))
            })?;
        let url = Url::parse(&format!("http://{domain}/"))?;
        let path = cookie.path.as_deref().unwrap_or("/");
        self.jar
            .add_cookie_str(&format!("{}={}; Path={path}", cookie.name, cookie.value), &url);
        Ok(())
    }

    async fn delete_all_cookies(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.jar = Arc::new(Jar::default());
        self.client = Self::build_client(
            self.process_id,
            &self.user_agent,
            self.proxy_port,
            Arc::clone(&self.jar),
        )?;
        Ok(())
    }

    async fn find_element(&mut self, selector: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        select_text(self.body(), selector)
    }

    async fn quit(&mut self) -> Result<()> {
        self.closed = true;
        self.page = None;
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        !self.closed
    }

    fn process_id(&self) -> u32 {
        self.process_id
    }

    fn parent_process_id(&self) -> u32 {
        self.parent_process_id
    }

    fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// Launches [`HttpBrowser`]s with logical process ids
pub struct HttpBrowserLauncher {
    user_agent: String,
}

impl HttpBrowserLauncher {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl BrowserLauncher for HttpBrowserLauncher {
    async fn launch(&self, browser_type: BrowserType, proxy_port: u16) -> Result<Box<dyn Browser>> {
        if browser_type != BrowserType::Http {
            debug!("Using the HTTP browser in place of {browser_type}");
        }
        let process_id = next_process_id();
        Ok(Box::new(HttpBrowser::new(
            process_id,
            &self.user_agent,
            proxy_port,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_text() {
        let html = "<html><head><title> Login </title></head><body><p id='msg'>hi <b>there</b></p></body></html>";
        assert_eq!(select_text(html, "title").unwrap().as_deref(), Some("Login"));
        assert_eq!(select_text(html, "#msg").unwrap().as_deref(), Some("hi there"));
        assert_eq!(select_text(html, "table").unwrap(), None);
        assert!(select_text(html, "<<").is_err());
    }

    #[tokio::test]
    async fn test_cookie_jar_round_trip() {
        let mut browser = HttpBrowser::new(1, "UA", 0).unwrap();
        browser
            .add_cookie(&Cookie::new("sid", "abc").with_domain("example.com"))
            .await
            .unwrap();
        browser.page = Some(LoadedPage {
            url: "http://example.com/".to_string(),
            body: String::new(),
        });
        let cookies = browser.cookies().await.unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "sid");
        assert_eq!(cookies[0].value, "abc");

        browser.delete_all_cookies().await.unwrap();
        assert!(browser.cookies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_browser_rejects_calls() {
        let mut browser = HttpBrowser::new(2, "UA", 0).unwrap();
        browser.quit().await.unwrap();
        assert!(!browser.is_alive().await);
        assert!(browser.navigate_to("http://example.com/").await.is_err());
    }
}
