//! TTL cache for static sub-resources served through the proxy
//!
//! Images, scripts and stylesheets are fetched over and over while a scan
//! fuzzes the same page. The cache answers repeat fetches from memory. It
//! never keeps `Set-Cookie`, so a cached response cannot carry one
//! caller's session into another caller's browser.

use super::session::{ProxyResponse, ProxySession};
use crate::http::HttpHeaders;
use crate::models::EngineConfig;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// How often expired entries are swept at most
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const CACHEABLE_CONTENT_TYPES: &[&str] = &[
    "image/",
    "text/css",
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
    "application/ecmascript",
];

/// Hooks the proxy calls around every session
pub trait ProxyCache: Send + Sync {
    /// Sweeps expired entries when due and serves a hit by filling `session.response`
    fn process_request(&self, session: &mut ProxySession);

    /// Stores an eligible response that is not cached yet
    fn process_response(&self, session: &ProxySession);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache variant that never stores nor serves anything
#[derive(Debug, Default)]
pub struct NullProxyCache;

impl ProxyCache for NullProxyCache {
    fn process_request(&self, _session: &mut ProxySession) {}

    fn process_response(&self, _session: &ProxySession) {}

    fn len(&self) -> usize {
        0
    }
}

/// Upper bound on cached sub-resources
pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    /// Response headers without `Set-Cookie`
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

/// Response cache keyed by request URL.
///
/// Expiry and capacity are enforced by `moka`; the sweep only schedules its
/// housekeeping, at most once per sweep interval and by a single caller.
pub struct TtlProxyCache {
    entries: Cache<String, CachedResponse>,
    sweep_interval: Duration,
    sweep_guard: Mutex<()>,
    epoch: Instant,
    last_sweep_ms: AtomicU64,
}

impl TtlProxyCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_config(DEFAULT_MAX_CAPACITY, ttl, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_config(max_capacity: u64, ttl: Duration, sweep_interval: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        debug!(
            "Proxy cache initialized: max_capacity={}, ttl={}s",
            max_capacity,
            ttl.as_secs()
        );

        Self {
            entries,
            sweep_interval,
            sweep_guard: Mutex::new(()),
            epoch: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    pub fn is_cacheable(content_type: &str) -> bool {
        let content_type = content_type.to_lowercase();
        CACHEABLE_CONTENT_TYPES
            .iter()
            .any(|t| content_type.starts_with(t) || content_type.contains(t))
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    /// Runs the eviction sweep if the window elapsed and no other caller is sweeping
    fn maybe_sweep(&self) {
        let interval_ms = self.sweep_interval.as_millis() as u64;
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        if now_ms.saturating_sub(self.last_sweep_ms.load(Ordering::Acquire)) < interval_ms {
            return;
        }

        let Some(_guard) = self.sweep_guard.try_lock() else {
            return;
        };
        if now_ms.saturating_sub(self.last_sweep_ms.load(Ordering::Acquire)) < interval_ms {
            return;
        }

        let evicted = self.evict_expired();
        self.last_sweep_ms.store(now_ms, Ordering::Release);
        if evicted > 0 {
            debug!("Proxy cache evicted {evicted} expired entries");
        }
    }

    /// Drops every expired entry, returning how many went away
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.entry_count();
        self.entries.run_pending_tasks();
        before.saturating_sub(self.entries.entry_count()) as usize
    }
}

impl ProxyCache for TtlProxyCache {
    fn process_request(&self, session: &mut ProxySession) {
        self.maybe_sweep();

        if let Some(cached) = self.entries.get(session.request.url.as_str()) {
            debug!("Proxy cache hit for {}", session.request.url);
            session.response = Some(ProxyResponse {
                status: cached.status,
                headers: cached.headers,
                body: cached.body,
                from_cache: true,
            });
        }
    }

    fn process_response(&self, session: &ProxySession) {
        let Some(ref response) = session.response else {
            return;
        };
        if response.from_cache || response.status != 200 {
            return;
        }
        let cacheable = response
            .content_type()
            .map(Self::is_cacheable)
            .unwrap_or(false);
        if !cacheable {
            return;
        }

        let entry = self
            .entries
            .entry(session.request.url.clone())
            .or_insert_with(|| {
                let mut headers = response.headers.clone();
                headers.remove("set-cookie");
                CachedResponse {
                    status: response.status,
                    headers,
                    body: response.body.clone(),
                }
            });
        if entry.is_fresh() {
            debug!("Proxy cache stored {}", session.request.url);
        }
    }

    fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }
}

/// Picks the cache variant the configuration asks for
pub fn build_cache(config: &EngineConfig) -> Arc<dyn ProxyCache> {
    if config.cache_active() {
        Arc::new(TtlProxyCache::new(Duration::from_secs(
            config.cache_ttl_secs as u64,
        )))
    } else {
        Arc::new(NullProxyCache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_for(url: &str) -> ProxySession {
        ProxySession::new(1, "GET", url, HttpHeaders::new())
    }

    fn respond(session: &mut ProxySession, content_type: &str, body: &[u8]) {
        let headers: HttpHeaders = [
            ("Content-Type", content_type),
            ("Set-Cookie", "sid=secret"),
            ("ETag", "\"v1\""),
        ]
        .into_iter()
        .collect();
        session.response = Some(ProxyResponse::new(200, headers, body.to_vec()));
    }

    #[test]
    fn test_round_trip_strips_set_cookie() {
        let cache = TtlProxyCache::new(Duration::from_secs(60));
        let mut first = session_for("http://example.com/logo.png");
        respond(&mut first, "image/png", &[0x89, 0x50, 0x4e, 0x47]);
        cache.process_response(&first);
        assert_eq!(cache.len(), 1);

        let mut second = session_for("http://example.com/logo.png");
        cache.process_request(&mut second);
        let served = second.response.expect("cache hit");
        assert!(served.from_cache);
        assert_eq!(served.body, vec![0x89, 0x50, 0x4e, 0x47]);
        assert_eq!(served.headers.get("etag"), Some("\"v1\""));
        assert!(!served.headers.contains("set-cookie"));
    }

    #[test]
    fn test_non_cacheable_content_type_is_skipped() {
        let cache = TtlProxyCache::new(Duration::from_secs(60));
        let mut session = session_for("http://example.com/");
        respond(&mut session, "text/html; charset=utf-8", b"<html></html>");
        cache.process_response(&session);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_first_response_wins() {
        let cache = TtlProxyCache::new(Duration::from_secs(60));
        let mut first = session_for("http://example.com/app.js");
        respond(&mut first, "application/javascript", b"one");
        cache.process_response(&first);
        let mut second = session_for("http://example.com/app.js");
        respond(&mut second, "application/javascript", b"two");
        cache.process_response(&second);

        let mut probe = session_for("http://example.com/app.js");
        cache.process_request(&mut probe);
        assert_eq!(probe.response.unwrap().body, b"one".to_vec());
    }

    #[test]
    fn test_expired_entries_are_evicted_and_not_served() {
        let cache = TtlProxyCache::with_config(16, Duration::from_millis(20), Duration::ZERO);
        let mut session = session_for("http://example.com/site.css");
        respond(&mut session, "text/css", b"body{}");
        cache.process_response(&session);
        assert_eq!(cache.len(), 1);

        std::thread::sleep(Duration::from_millis(50));

        let mut probe = session_for("http://example.com/site.css");
        cache.process_request(&mut probe);
        assert!(probe.response.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_bounds_the_cache() {
        let cache = TtlProxyCache::with_config(2, Duration::from_secs(60), DEFAULT_SWEEP_INTERVAL);
        for i in 0..6 {
            let mut session = session_for(&format!("http://example.com/img{i}.png"));
            respond(&mut session, "image/png", b"png");
            cache.process_response(&session);
        }
        assert!(cache.len() <= 2);
    }

    #[test]
    fn test_null_cache_never_serves() {
        let cache = NullProxyCache;
        let mut session = session_for("http://example.com/logo.png");
        respond(&mut session, "image/png", b"png");
        cache.process_response(&session);
        let mut probe = session_for("http://example.com/logo.png");
        cache.process_request(&mut probe);
        assert!(probe.response.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_build_cache_honours_ttl_and_flag() {
        let mut config = EngineConfig::default();
        config.cache_ttl_secs = 0;
        let cache = build_cache(&config);
        let mut session = session_for("http://example.com/logo.png");
        respond(&mut session, "image/png", b"png");
        cache.process_response(&session);
        assert!(cache.is_empty());

        config.cache_ttl_secs = 30;
        config.cache_enabled = false;
        assert!(build_cache(&config).is_empty());
    }
}
