//! Intercepting proxy between the browser pool and the network
//!
//! [`ProxyService`] owns all proxy state: global header overrides, the
//! per-browser header registrations, the correlated-session map and the
//! sub-resource cache. The listener in [`server`] calls into it through the
//! [`RequestInterceptor`] and [`ResponseObserver`] seams, so the header and
//! caching rules can be exercised without a socket.

pub mod cache;
pub mod server;
pub mod session;

pub use cache::{build_cache, NullProxyCache, ProxyCache, TtlProxyCache};
pub use session::{CorrelationKey, ProxyRequest, ProxyResponse, ProxySession};

use crate::error::Result;
use crate::http::headers::{parse_header_block, parse_header_line};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use self::server::{ProxyServer, ServerHandle};

/// Registered headers applied to sub-resource requests as well as pages
const ALWAYS_APPLIED_HEADERS: &[&str] = &["User-Agent", "Accept-Language"];

const SHARD_COUNT: usize = 16;

/// Map striped into independently locked shards by browser process id.
///
/// Everything a process owns lives in one shard, so publishing or clearing
/// for one browser never blocks the others.
struct ProcessShards<K, V> {
    shards: Vec<RwLock<HashMap<K, V>>>,
}

impl<K: Eq + Hash, V> ProcessShards<K, V> {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, process_id: u32) -> &RwLock<HashMap<K, V>> {
        &self.shards[process_id as usize % SHARD_COUNT]
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}

/// Mutates an outgoing request before it leaves the proxy
pub trait RequestInterceptor: Send + Sync {
    fn before_request(&self, session: &mut ProxySession);
}

/// Receives a session once its response is known
pub trait ResponseObserver: Send + Sync {
    fn before_response(&self, session: &mut ProxySession);
}

/// Invoked with the request host for every intercepted request
pub type RequestCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Process-wide proxy state with an explicit start/stop lifecycle
pub struct ProxyService {
    global_headers: RwLock<Vec<(String, String)>>,
    registrations: ProcessShards<u32, Vec<(String, String)>>,
    sessions: ProcessShards<CorrelationKey, ProxySession>,
    cache: Arc<dyn ProxyCache>,
    on_request: RwLock<Option<RequestCallback>>,
    hooks_attached: AtomicBool,
    published: Notify,
    server: Mutex<Option<ServerHandle>>,
}

impl ProxyService {
    pub fn new(cache: Arc<dyn ProxyCache>) -> Self {
        Self {
            global_headers: RwLock::new(Vec::new()),
            registrations: ProcessShards::new(),
            sessions: ProcessShards::new(),
            cache,
            on_request: RwLock::new(None),
            hooks_attached: AtomicBool::new(false),
            published: Notify::new(),
            server: Mutex::new(None),
        }
    }

    /// Tears down any previous state, installs the hooks and starts listening.
    ///
    /// Malformed header strings are dropped. A `port` of 0 attaches the hooks
    /// without opening a listener.
    pub async fn initialize(self: &Arc<Self>, global_headers: &[String], port: u16) -> Result<()> {
        let previous = self.server.lock().take();
        if let Some(handle) = previous {
            handle.stop().await;
        }
        self.cleanup(port);

        let parsed: Vec<(String, String)> = global_headers
            .iter()
            .filter_map(|h| parse_header_line(h))
            .collect();
        if parsed.len() != global_headers.len() {
            debug!(
                "Ignored {} malformed global header(s)",
                global_headers.len() - parsed.len()
            );
        }
        *self.global_headers.write() = parsed;
        self.hooks_attached.store(true, Ordering::SeqCst);

        if port != 0 {
            let handle = ProxyServer::bind(port, Arc::clone(self)).await?;
            *self.server.lock() = Some(handle);
            info!("Intercepting proxy listening on 127.0.0.1:{port}");
        }
        Ok(())
    }

    /// Detaches the hooks, drops global headers and stops the listener.
    ///
    /// When nothing was listening, `port` is bound and released once so a
    /// stale listener from an earlier run is noticed. Never fails.
    pub fn cleanup(&self, port: u16) {
        self.hooks_attached.store(false, Ordering::SeqCst);
        self.global_headers.write().clear();

        match self.server.lock().take() {
            Some(handle) => {
                handle.shutdown();
                info!("Intercepting proxy stopped");
            }
            None if port != 0 => match std::net::TcpListener::bind(("127.0.0.1", port)) {
                Ok(listener) => drop(listener),
                Err(e) => debug!("Port {port} still held elsewhere: {e}"),
            },
            None => {}
        }
    }

    /// Stops the proxy and forgets every registration and session
    pub fn shutdown(&self, port: u16) {
        self.cleanup(port);
        self.registrations.clear();
        self.sessions.clear();
    }

    pub fn is_running(&self) -> bool {
        self.server.lock().is_some()
    }

    /// Port of the running listener, if any
    pub fn port(&self) -> Option<u16> {
        self.server.lock().as_ref().map(|h| h.port())
    }

    pub fn set_request_callback(&self, callback: Option<RequestCallback>) {
        *self.on_request.write() = callback;
    }

    /// Replaces the header overrides registered for one browser process.
    ///
    /// `header_block` holds newline-delimited `key:value` lines; malformed
    /// lines are skipped. An empty `user_agent` registers no User-Agent.
    pub fn register_instance_headers(
        &self,
        process_id: u32,
        user_agent: Option<&str>,
        header_block: &str,
    ) {
        let mut headers = Vec::new();
        if let Some(ua) = user_agent.filter(|ua| !ua.trim().is_empty()) {
            headers.push(("User-Agent".to_string(), ua.to_string()));
        }
        headers.extend(parse_header_block(header_block));
        self.registrations
            .shard(process_id)
            .write()
            .insert(process_id, headers);
    }

    pub fn registered_headers(&self, process_id: u32) -> Option<Vec<(String, String)>> {
        self.registrations
            .shard(process_id)
            .read()
            .get(&process_id)
            .cloned()
    }

    /// Removes the registration of one process and the sessions it published
    pub fn clear_headers(&self, process_id: u32) {
        self.registrations
            .shard(process_id)
            .write()
            .remove(&process_id);
        self.sessions
            .shard(process_id)
            .write()
            .retain(|key, _| key.process_id != process_id);
    }

    pub fn session(&self, process_id: u32, url: &str) -> Option<ProxySession> {
        self.sessions
            .shard(process_id)
            .read()
            .get(&CorrelationKey::new(process_id, url))
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn cache(&self) -> &Arc<dyn ProxyCache> {
        &self.cache
    }

    /// Waits until a session for (process, URL) has been published
    pub async fn wait_for_session(
        &self,
        process_id: u32,
        url: &str,
        timeout: Duration,
    ) -> Option<ProxySession> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(session) = self.session(process_id, url) {
                return Some(session);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.session(process_id, url);
            }
        }
    }

    fn hooks_attached(&self) -> bool {
        self.hooks_attached.load(Ordering::SeqCst)
    }
}

impl RequestInterceptor for ProxyService {
    fn before_request(&self, session: &mut ProxySession) {
        if !self.hooks_attached() {
            return;
        }

        let page_class = session.is_page_class();
        session.buffer_response = page_class;

        let process_id = session.request.process_id;
        if let Some(registered) = self.registrations.shard(process_id).read().get(&process_id) {
            for (key, value) in registered {
                let always = ALWAYS_APPLIED_HEADERS
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(key));
                if page_class || always {
                    session.request.headers.set(key, value.as_str());
                }
            }
        }

        for (key, value) in self.global_headers.read().iter() {
            session.request.headers.set(key, value.as_str());
        }

        if let Some(callback) = self.on_request.read().as_ref() {
            callback(&session.host());
        }

        self.cache.process_request(session);
    }
}

impl ResponseObserver for ProxyService {
    fn before_response(&self, session: &mut ProxySession) {
        if !self.hooks_attached() {
            return;
        }

        self.cache.process_response(session);

        let mut published = session.clone();
        if !published.buffer_response {
            if let Some(response) = published.response.as_mut() {
                response.body.clear();
            }
        }
        let key = session.correlation_key();
        self.sessions
            .shard(key.process_id)
            .write()
            .insert(key, published);
        self.published.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpHeaders;

    fn attached_service() -> ProxyService {
        let service = ProxyService::new(Arc::new(NullProxyCache));
        service.hooks_attached.store(true, Ordering::SeqCst);
        service
    }

    fn request(process_id: u32, accept: &str) -> ProxySession {
        let headers: HttpHeaders = [("Accept", accept), ("User-Agent", "original")]
            .into_iter()
            .collect();
        ProxySession::new(process_id, "GET", "http://example.com/page", headers)
    }

    #[test]
    fn test_registration_skips_malformed_lines() {
        let service = attached_service();
        service.register_instance_headers(5, Some("UA/1"), "X-Good: 1\nbroken\nX-Also:2");
        let registered = service.registered_headers(5).unwrap();
        assert_eq!(registered.len(), 3);
        assert_eq!(registered[0], ("User-Agent".to_string(), "UA/1".to_string()));
    }

    #[test]
    fn test_empty_user_agent_is_not_registered() {
        let service = attached_service();
        service.register_instance_headers(5, Some(""), "X-Good: 1");
        service.register_instance_headers(6, None, "");
        assert_eq!(service.registered_headers(5).unwrap().len(), 1);
        assert!(service.registered_headers(6).unwrap().is_empty());
    }

    #[test]
    fn test_sub_resource_gets_only_always_applied_headers() {
        let service = attached_service();
        service.register_instance_headers(
            9,
            Some("Scanner/1"),
            "X-Custom: yes\nAccept-Language: de-DE",
        );

        let mut page = request(9, "text/html");
        service.before_request(&mut page);
        assert_eq!(page.request.headers.get("user-agent"), Some("Scanner/1"));
        assert_eq!(page.request.headers.get("x-custom"), Some("yes"));
        assert!(page.buffer_response);

        let mut image = request(9, "image/webp,*/*");
        service.before_request(&mut image);
        assert_eq!(image.request.headers.get("user-agent"), Some("Scanner/1"));
        assert_eq!(image.request.headers.get("accept-language"), Some("de-DE"));
        assert!(!image.request.headers.contains("x-custom"));
        assert!(!image.buffer_response);
    }

    #[test]
    fn test_detached_hooks_leave_requests_alone() {
        let service = ProxyService::new(Arc::new(NullProxyCache));
        service.register_instance_headers(1, Some("Scanner/1"), "");
        let mut page = request(1, "text/html");
        service.before_request(&mut page);
        assert_eq!(page.request.headers.get("user-agent"), Some("original"));
    }

    #[test]
    fn test_request_callback_receives_host() {
        let service = attached_service();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: RequestCallback = Arc::new(move |host: &str| {
            sink.lock().push(host.to_string());
        });
        service.set_request_callback(Some(callback));
        let mut page = request(1, "text/html");
        service.before_request(&mut page);
        assert_eq!(*seen.lock(), vec!["example.com".to_string()]);
    }

    #[test]
    fn test_published_sub_resource_body_is_dropped() {
        let service = attached_service();
        let mut image = request(3, "image/png");
        service.before_request(&mut image);
        image.response = Some(ProxyResponse::new(200, HttpHeaders::new(), b"png".to_vec()));
        service.before_response(&mut image);

        let published = service.session(3, "http://example.com/page").unwrap();
        assert!(published.response.unwrap().body.is_empty());
    }

    #[test]
    fn test_clear_headers_spares_processes_sharing_a_shard() {
        let service = attached_service();
        let neighbour = 3 + SHARD_COUNT as u32;
        for process_id in [3, neighbour, 4] {
            service.register_instance_headers(process_id, Some("UA"), "");
            let mut page = request(process_id, "text/html");
            service.before_request(&mut page);
            page.response = Some(ProxyResponse::new(200, HttpHeaders::new(), b"ok".to_vec()));
            service.before_response(&mut page);
        }
        assert_eq!(service.session_count(), 3);

        service.clear_headers(3);
        assert!(service.registered_headers(3).is_none());
        assert!(service.session(3, "http://example.com/page").is_none());
        assert!(service.registered_headers(neighbour).is_some());
        assert!(service.session(neighbour, "http://example.com/page").is_some());
        assert_eq!(service.session_count(), 2);

        service.shutdown(0);
        assert_eq!(service.session_count(), 0);
        assert!(service.registered_headers(4).is_none());
    }
}
