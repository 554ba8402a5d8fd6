//! Scan entry point
//!
//! [`ScanEngine::start_engine`] runs the enabled plugins against every
//! target URL and returns whatever was found. Individual plugin failures are
//! logged and never abort the run.

use crate::browser::{BrowserLauncher, BrowserPool, DetachedProcesses};
use crate::context::{RequestParameters, ScanContext};
use crate::error::Result;
use crate::models::{EngineConfig, Vulnerability};
use crate::payloads::{PayloadSource, PayloadStore};
use crate::plugins::{registry, FuzzStats, FuzzingEngine, Plugin, PluginKind};
use crate::proxy::{build_cache, ProxyService};
use crate::target::Target;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation shared by everything taking part in a scan
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops new requests; requests already in flight finish normally
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Orchestrates plugin runs over the shared proxy and browser pool
pub struct ScanEngine {
    config: EngineConfig,
    proxy: Arc<ProxyService>,
    pool: Arc<BrowserPool>,
    payloads: Arc<dyn PayloadSource>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl ScanEngine {
    pub fn new(
        config: EngineConfig,
        proxy: Arc<ProxyService>,
        pool: Arc<BrowserPool>,
        payloads: Arc<dyn PayloadSource>,
    ) -> Self {
        Self {
            config,
            proxy,
            pool,
            payloads,
            plugins: registry(),
        }
    }

    /// Replaces the plugin set the engine chooses from
    pub fn with_plugins(mut self, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        self.plugins = plugins;
        self
    }

    /// Builds every collaborator from configuration: loads payloads, starts
    /// the proxy and provisions the browser pool
    pub async fn bootstrap(config: EngineConfig) -> Result<Self> {
        let payloads = PayloadStore::load(&config.payload_dir)?;

        let proxy = Arc::new(ProxyService::new(build_cache(&config)));
        proxy
            .initialize(&config.global_headers, config.proxy_port)
            .await?;

        let launcher: Arc<dyn BrowserLauncher> = default_launcher(&config);
        let pool = BrowserPool::new(
            &config,
            launcher,
            Arc::new(DetachedProcesses),
            Arc::clone(&proxy),
        );
        if let Err(e) = pool.create_browser_instances().await {
            pool.dispose().await;
            proxy.shutdown(config.proxy_port);
            return Err(e);
        }

        Ok(Self::new(config, proxy, Arc::new(pool), Arc::new(payloads)))
    }

    /// Releases the browsers and stops the proxy
    pub async fn shutdown(&self) {
        self.pool.dispose().await;
        self.proxy.shutdown(self.config.proxy_port);
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn proxy(&self) -> &Arc<ProxyService> {
        &self.proxy
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    /// Runs the enabled plugins against every URL.
    ///
    /// Unknown plugin names and malformed URLs are logged and skipped. The
    /// returned findings are ordered by severity.
    pub async fn start_engine(
        &self,
        urls: &[String],
        enabled: &HashSet<String>,
        use_full_payloads: bool,
        verbose: bool,
        cancel: CancelToken,
    ) -> Vec<Vulnerability> {
        let selected = self.select_plugins(enabled);
        let context = Arc::new(
            ScanContext::new(&self.config, Arc::clone(&self.pool), Arc::clone(&self.proxy))
                .with_verbose(verbose)
                .with_cancel(cancel.clone()),
        );

        let mut fuzzers = Vec::new();
        for plugin in selected {
            match plugin.describe().kind {
                PluginKind::Detector => context.register_detector(plugin),
                PluginKind::Fuzzer => fuzzers.push(plugin),
            }
        }
        info!(
            "Scanning {} URL(s) with {} fuzzer(s) and {} detector(s)",
            urls.len(),
            fuzzers.len(),
            context.detector_count()
        );

        let pb = if verbose {
            ProgressBar::new((urls.len() * fuzzers.len().max(1)) as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        for url in urls {
            if cancel.is_cancelled() {
                info!("Scan cancelled, skipping remaining targets");
                break;
            }
            let target = match Target::create(url) {
                Ok(target) => target,
                Err(e) => {
                    warn!("Skipping malformed URL '{url}': {e}");
                    continue;
                }
            };

            pb.set_message(format!("Baseline {url}"));
            self.baseline(&context, &target).await;

            let mut set = JoinSet::new();
            for plugin in &fuzzers {
                let test_cases = plugin.test_cases(self.payloads.as_ref(), use_full_payloads);
                let name = plugin.describe().name;
                let engine = FuzzingEngine::init(
                    Arc::clone(&context),
                    target.clone(),
                    Arc::clone(plugin),
                    test_cases,
                );
                set.spawn(async move { (name, engine.do_tests().await) });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((name, FuzzStats { requests, findings, .. })) => {
                        debug!("Plugin '{name}' finished on {url}: {requests} request(s), {findings} finding(s)");
                        pb.set_message(format!("{name} done on {url}"));
                    }
                    Err(e) => error!("Plugin task panicked: {e}"),
                }
                pb.inc(1);
            }
        }
        pb.finish_with_message("Scan complete");

        let mut vulnerabilities = context.take_vulnerabilities();
        vulnerabilities.sort_by(|a, b| a.level.cmp(&b.level));
        info!("Scan finished with {} finding(s)", vulnerabilities.len());
        vulnerabilities
    }

    /// Enabled plugins in registry order
    fn select_plugins(&self, enabled: &HashSet<String>) -> Vec<Arc<dyn Plugin>> {
        let wanted: HashSet<String> = enabled.iter().map(|n| n.trim().to_lowercase()).collect();
        for name in &wanted {
            if !self.plugins.iter().any(|p| p.describe().name == name) {
                warn!("Unknown plugin '{name}' ignored");
            }
        }
        self.plugins
            .iter()
            .filter(|p| wanted.contains(p.describe().name))
            .cloned()
            .collect()
    }

    /// Requests the unmodified URL once and runs the detectors on it
    async fn baseline(&self, context: &ScanContext, target: &Target) {
        if context.detector_count() == 0 {
            return;
        }
        let url = target.uri().to_string();
        let params = RequestParameters::new(&url, context.default_browser());
        match context.send_request(params).await {
            Ok(response) => {
                if response.has_body() {
                    context.run_detectors(&response, target, "baseline", "baseline", "", "");
                }
                if let Err(e) = context.release(response).await {
                    error!("Failed to release browser after baseline of {url}: {e}");
                }
            }
            Err(e) => warn!("Baseline request to {url} failed: {e}"),
        }
    }
}

#[cfg(feature = "browser")]
fn default_launcher(config: &EngineConfig) -> Arc<dyn BrowserLauncher> {
    Arc::new(crate::browser::chromium::ChromiumLauncher::new(
        config.user_agent.clone(),
    ))
}

#[cfg(not(feature = "browser"))]
fn default_launcher(config: &EngineConfig) -> Arc<dyn BrowserLauncher> {
    Arc::new(crate::browser::http_browser::HttpBrowserLauncher::new(
        config.user_agent.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
