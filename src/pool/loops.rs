//! Background maintenance loops: health sweep, lease expiry sweep, and
//! country-code enrichment.
//!
//! The loops are independent and may overlap; their writes commute because
//! each touches disjoint field paths (probes write status/response_time,
//! expiry rewrites leases, enrichment writes country_code). Each loop
//! re-reads the settings snapshot at the start of every iteration and
//! observes the shutdown token both between iterations and while sleeping.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use futures::{stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::modules::geo::CountryLookup;
use crate::modules::store::{ProxyFilter, ProxyStore};
use crate::pool::prober::{probe_and_record, ProxyProber};
use crate::pool::settings::SettingsRegistry;

/// Concurrent probes per health sweep (fan-out cap).
const PROBE_CONCURRENCY: usize = 20;
/// Country enrichment cadence.
const GEO_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(20);

#[derive(Clone)]
pub struct BackgroundLoops {
    store: ProxyStore,
    settings: SettingsRegistry,
    prober: Arc<dyn ProxyProber>,
    geo: Arc<dyn CountryLookup>,
    shutdown: CancellationToken,
}

impl BackgroundLoops {
    pub fn new(
        store: ProxyStore,
        settings: SettingsRegistry,
        prober: Arc<dyn ProxyProber>,
        geo: Arc<dyn CountryLookup>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            settings,
            prober,
            geo,
            shutdown,
        }
    }

    /// Start all three loops. They run until the shutdown token fires.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().health_loop()),
            tokio::spawn(self.clone().expiry_loop()),
            tokio::spawn(self.clone().geo_loop()),
        ]
    }

    // ========================================================================
    // Health sweep
    // ========================================================================

    async fn health_loop(self) {
        info!("[Prober] Health sweep loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let interval = self.settings.snapshot().background_check_proxies_interval;
            self.run_health_sweep().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(StdDuration::from_secs(interval)) => {}
            }
        }
        info!("[Prober] Health sweep loop stopped");
    }

    /// Probe every proxy concurrently and write back status/response_time.
    /// Waits for the whole batch before returning.
    pub async fn run_health_sweep(&self) {
        let proxies = match self.store.list_proxies(&ProxyFilter::default()) {
            Ok(proxies) => proxies,
            Err(e) => {
                error!("[Prober] Failed to enumerate proxies for sweep: {}", e);
                return;
            }
        };
        if proxies.is_empty() {
            return;
        }

        info!("[Prober] Sweeping {} proxies...", proxies.len());
        stream::iter(proxies)
            .map(|proxy| {
                let store = self.store.clone();
                let prober = self.prober.clone();
                async move {
                    probe_and_record(&store, prober.as_ref(), &proxy).await;
                }
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;
    }

    // ========================================================================
    // Expiry sweep
    // ========================================================================

    async fn expiry_loop(self) {
        info!("[Expiry] Lease expiry loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let interval = self.settings.snapshot().background_check_proxies_interval;
            self.run_expiry_sweep().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(StdDuration::from_secs(interval)) => {}
            }
        }
        info!("[Expiry] Lease expiry loop stopped");
    }

    /// Remove every lease older than the threshold horizon. When that
    /// empties a proxy's lease map, `last_used` is cleared in the same
    /// write.
    pub async fn run_expiry_sweep(&self) {
        let settings = self.settings.snapshot();
        let threshold = Utc::now() - Duration::minutes(settings.threshold_time_minutes);

        let proxies = match self.store.list_proxies(&ProxyFilter::default()) {
            Ok(proxies) => proxies,
            Err(e) => {
                error!("[Expiry] Failed to enumerate proxies for sweep: {}", e);
                return;
            }
        };

        for proxy in proxies {
            if proxy.leases_malformed {
                error!(
                    "[Expiry] instance_ids in proxy {} is not a mapping, skipping: {}",
                    proxy.id, proxy.raw_leases
                );
                continue;
            }

            let expired: Vec<String> = proxy
                .instance_ids
                .iter()
                .filter(|(_, seen)| **seen < threshold)
                .map(|(instance, _)| instance.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }

            info!(
                "[Expiry] Proxy {} has expired instances: {:?}",
                proxy.id, expired
            );
            let clear_last_used = expired.len() == proxy.instance_ids.len();
            match self
                .store
                .remove_expired_leases(&proxy.id, &expired, clear_last_used)
            {
                Ok(true) => {
                    for instance in &expired {
                        info!(
                            "[Expiry] Removed expired instance {} from proxy {}",
                            instance, proxy.id
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!("[Expiry] Failed to expire leases on proxy {}: {}", proxy.id, e);
                }
            }
        }
    }

    // ========================================================================
    // Country enrichment
    // ========================================================================

    async fn geo_loop(self) {
        info!("[Geo] Country enrichment loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.run_geo_sweep().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(GEO_SWEEP_INTERVAL) => {}
            }
        }
        info!("[Geo] Country enrichment loop stopped");
    }

    /// Fill in `country_code` for proxies that lack one. Lookup failures are
    /// logged and retried on the next cycle; they never mark the proxy.
    pub async fn run_geo_sweep(&self) {
        let proxies = match self.store.list_proxies(&ProxyFilter::default()) {
            Ok(proxies) => proxies,
            Err(e) => {
                error!("[Geo] Failed to enumerate proxies for sweep: {}", e);
                return;
            }
        };

        for proxy in proxies {
            if proxy.country_code.is_some() {
                continue;
            }

            let geo = self.geo.clone();
            let ip = proxy.ip.clone();
            let looked_up = tokio::task::spawn_blocking(move || geo.lookup(&ip)).await;

            match looked_up {
                Ok(Ok(Some(code))) => match self.store.set_country_code(&proxy.id, &code) {
                    Ok(true) => {
                        info!("[Geo] Proxy {} ({}) -> {}", proxy.id, proxy.ip, code);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!("[Geo] Failed to record country for proxy {}: {}", proxy.id, e);
                    }
                },
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(
                        "[Geo] Country lookup for proxy {} ({}) failed: {}",
                        proxy.id, proxy.ip, e
                    );
                }
                Err(e) => {
                    error!("[Geo] Lookup task for proxy {} panicked: {}", proxy.id, e);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
