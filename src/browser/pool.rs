//! Fixed-size pools of browser instances, one pool per browser type
//!
//! Every pool keeps one semaphore permit per idle instance. Acquiring takes a
//! permit (waiting up to the configured timeout) and moves an idle instance
//! out to the caller; releasing moves it back and returns the permit. The set
//! of leased process ids is what lets the pool reject foreign or repeated
//! releases.

use super::process::ProcessControl;
use super::{BrowserInstance, BrowserLauncher, BrowserType};
use crate::error::{HalberdError, Result};
use crate::models::{BrowserAllocation, EngineConfig};
use crate::proxy::ProxyService;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const EXIT_WAIT: Duration = Duration::from_secs(5);

struct TypePool {
    idle: Mutex<VecDeque<BrowserInstance>>,
    leased: Mutex<HashSet<u32>>,
    permits: Semaphore,
    target: AtomicUsize,
}

impl TypePool {
    fn new(target: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            leased: Mutex::new(HashSet::new()),
            permits: Semaphore::new(0),
            target: AtomicUsize::new(target),
        }
    }

    fn total(&self) -> usize {
        self.idle.lock().len() + self.leased.lock().len()
    }

    fn put_idle(&self, instance: BrowserInstance) {
        self.idle.lock().push_back(instance);
        self.permits.add_permits(1);
    }
}

/// Bounded pools of browsers with blocking acquisition
pub struct BrowserPool {
    launcher: Arc<dyn BrowserLauncher>,
    processes: Arc<dyn ProcessControl>,
    proxy: Arc<ProxyService>,
    proxy_port: u16,
    pools: HashMap<BrowserType, TypePool>,
    acquire_timeout: Duration,
    user_agent: String,
    instance_headers: String,
}

impl BrowserPool {
    pub fn new(
        config: &EngineConfig,
        launcher: Arc<dyn BrowserLauncher>,
        processes: Arc<dyn ProcessControl>,
        proxy: Arc<ProxyService>,
    ) -> Self {
        let pools = config
            .browsers
            .iter()
            .map(|BrowserAllocation { browser_type, count }| (*browser_type, TypePool::new(*count)))
            .collect();

        Self {
            launcher,
            processes,
            proxy,
            proxy_port: config.proxy_port,
            pools,
            acquire_timeout: config.acquire_timeout(),
            user_agent: config.user_agent.clone(),
            instance_headers: config.instance_headers.clone(),
        }
    }

    /// Changes the provisioned size of one pool; takes effect on the next
    /// `create_browser_instances` or release
    pub fn set_target(&mut self, browser_type: BrowserType, count: usize) {
        self.pools
            .entry(browser_type)
            .or_insert_with(|| TypePool::new(count))
            .target
            .store(count, Ordering::SeqCst);
    }

    /// Reconciles every pool with its provisioned size: starts missing
    /// instances and tears down idle surplus ones
    pub async fn create_browser_instances(&self) -> Result<()> {
        for (browser_type, pool) in &self.pools {
            let target = pool.target.load(Ordering::SeqCst);
            let total = pool.total();

            if total < target {
                info!("Starting {} {browser_type} browser(s)", target - total);
                for _ in total..target {
                    let browser = self.launcher.launch(*browser_type, self.proxy_port).await?;
                    let instance = BrowserInstance::new(browser, *browser_type);
                    debug!("Started {browser_type} browser {}", instance.process_id());
                    pool.put_idle(instance);
                }
            } else if total > target {
                info!("Stopping {} surplus {browser_type} browser(s)", total - target);
                for _ in target..total {
                    let Ok(permit) = pool.permits.try_acquire() else {
                        // the rest are leased and get dropped on release
                        break;
                    };
                    permit.forget();
                    let surplus = pool.idle.lock().pop_back();
                    if let Some(instance) = surplus {
                        self.teardown(instance).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Hands out an idle browser of `browser_type`, waiting up to the acquire timeout
    pub async fn acquire_browser(&self, browser_type: BrowserType) -> Result<BrowserInstance> {
        let pool = self
            .pools
            .get(&browser_type)
            .ok_or(HalberdError::UnknownBrowserType(browser_type))?;

        let permit = match tokio::time::timeout(self.acquire_timeout, pool.permits.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(HalberdError::PoolMisuse(format!(
                    "{browser_type} pool was disposed"
                )))
            }
            Err(_) => {
                return Err(HalberdError::BrowserUnavailable {
                    browser_type,
                    waited_ms: self.acquire_timeout.as_millis() as u64,
                })
            }
        };
        permit.forget();

        let instance = pool.idle.lock().pop_front();
        let Some(instance) = instance else {
            return Err(HalberdError::BrowserUnavailable {
                browser_type,
                waited_ms: self.acquire_timeout.as_millis() as u64,
            });
        };

        let process_id = instance.process_id();
        pool.leased.lock().insert(process_id);
        self.proxy.register_instance_headers(
            process_id,
            Some(&self.user_agent),
            &self.instance_headers,
        );
        debug!("Acquired {browser_type} browser {process_id}");
        Ok(instance)
    }

    /// Takes a leased browser back and makes it available again.
    ///
    /// Releasing an instance this pool did not hand out, or releasing twice,
    /// is reported as `PoolMisuse`.
    pub async fn release_browser(&self, mut instance: BrowserInstance) -> Result<()> {
        let browser_type = instance.browser_type();
        let process_id = instance.process_id();
        let pool = self.pools.get(&browser_type).ok_or_else(|| {
            HalberdError::PoolMisuse(format!(
                "browser {process_id} has type {browser_type} which this pool does not manage"
            ))
        })?;

        if !pool.leased.lock().remove(&process_id) {
            error!("Release of browser {process_id} that is not leased from the pool");
            return Err(HalberdError::PoolMisuse(format!(
                "browser {process_id} is not leased from this pool"
            )));
        }
        self.proxy.clear_headers(process_id);

        if pool.permits.is_closed() {
            debug!("Pool disposed, shutting down returned {browser_type} browser {process_id}");
            self.teardown(instance).await;
            return Ok(());
        }

        if pool.total() >= pool.target.load(Ordering::SeqCst) {
            debug!("Dropping surplus {browser_type} browser {process_id}");
            self.teardown(instance).await;
            return Ok(());
        }

        if !instance.browser().is_alive().await {
            warn!("{browser_type} browser {process_id} died, starting a replacement");
            self.teardown(instance).await;
            match self.launcher.launch(browser_type, self.proxy_port).await {
                Ok(browser) => instance = BrowserInstance::new(browser, browser_type),
                Err(e) => {
                    error!("Could not replace {browser_type} browser: {e}");
                    return Ok(());
                }
            }
        }

        pool.put_idle(instance);
        debug!("Released {browser_type} browser {process_id}");
        Ok(())
    }

    /// Idle browsers across all pools
    pub fn available_browsers(&self) -> usize {
        self.pools.values().map(|p| p.idle.lock().len()).sum()
    }

    pub fn available_browsers_by_type(&self, browser_type: BrowserType) -> usize {
        self.pools
            .get(&browser_type)
            .map(|p| p.idle.lock().len())
            .unwrap_or(0)
    }

    pub fn leased_browsers(&self) -> usize {
        self.pools.values().map(|p| p.leased.lock().len()).sum()
    }

    pub fn browser_types(&self) -> Vec<BrowserType> {
        let mut types: Vec<BrowserType> = self.pools.keys().copied().collect();
        types.sort();
        types
    }

    /// Shuts down every idle browser and closes the pools to further acquisition
    pub async fn dispose(&self) {
        for (browser_type, pool) in &self.pools {
            pool.permits.close();
            let drained: Vec<BrowserInstance> = pool.idle.lock().drain(..).collect();
            for instance in drained {
                self.teardown(instance).await;
            }

            let leased = pool.leased.lock().len();
            if leased > 0 {
                warn!("Disposing {browser_type} pool with {leased} browser(s) still leased");
            }
        }
        info!("Browser pool disposed");
    }

    async fn teardown(&self, mut instance: BrowserInstance) {
        let process_id = instance.process_id();
        if let Err(e) = instance.browser().quit().await {
            warn!("Browser {process_id} did not quit cleanly: {e}");
        }
        if !self.processes.has_exited(process_id) {
            if let Err(e) = self.processes.kill(process_id) {
                warn!("Failed to kill browser process {process_id}: {e}");
            }
            if !self.processes.wait_for_exit(process_id, EXIT_WAIT).await {
                warn!("Browser process {process_id} is still running");
            }
        }
        self.proxy.clear_headers(process_id);
    }
}
