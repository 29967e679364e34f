//! Proxy health probing.
//!
//! A probe issues a GET through the proxy to each URL in the check set. A
//! proxy is UP when at least one URL answers successfully; the reported
//! latency is the arithmetic mean of the successful samples in true
//! milliseconds.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};
use url::Url;

use crate::models::proxy::{Proxy, ProxyProtocol, ProxyStatus};
use crate::modules::store::ProxyStore;

/// Per-URL timeout. Kept well under the default sweep interval divided by
/// the number of check URLs so one slow proxy cannot stall a sweep lap.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_CHECK_URLS: [&str; 3] = [
    "https://google.com",
    "https://bing.com",
    "https://yahoo.com",
];

// ============================================================================
// ProbeReport
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReport {
    pub status: ProxyStatus,
    /// Mean latency of the successful samples; None when every URL failed.
    pub avg_response_ms: Option<f64>,
}

impl ProbeReport {
    pub fn down() -> Self {
        Self {
            status: ProxyStatus::Down,
            avg_response_ms: None,
        }
    }
}

#[async_trait]
pub trait ProxyProber: Send + Sync {
    async fn probe(&self, proxy: &Proxy) -> ProbeReport;
}

/// Probe a proxy and write the outcome back to the store. Shared by the
/// health sweep and the probe-on-add/edit paths; failures are logged and
/// isolated so one bad proxy never aborts a batch.
pub async fn probe_and_record(store: &ProxyStore, prober: &dyn ProxyProber, proxy: &Proxy) {
    let report = prober.probe(proxy).await;
    match store.set_probe_result(&proxy.id, report.status, report.avg_response_ms) {
        Ok(true) => {
            let latency = report
                .avg_response_ms
                .map_or("N/A".to_string(), |ms| format!("{:.0} ms", ms));
            info!(
                "[Prober] Proxy {} ({}:{}): {} (avg {})",
                proxy.id, proxy.ip, proxy.port, report.status, latency
            );
        }
        Ok(false) => {
            // Deleted mid-probe.
            warn!("[Prober] Proxy {} vanished before its result was recorded", proxy.id);
        }
        Err(e) => {
            warn!("[Prober] Failed to record result for proxy {}: {}", proxy.id, e);
        }
    }
}

// ============================================================================
// HttpProber
// ============================================================================

pub struct HttpProber {
    check_urls: Vec<String>,
    timeout: Duration,
}

impl HttpProber {
    pub fn new() -> Self {
        Self {
            check_urls: DEFAULT_CHECK_URLS.iter().map(|u| u.to_string()).collect(),
            timeout: PROBE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_urls(urls: Vec<String>, timeout: Duration) -> Self {
        Self {
            check_urls: urls,
            timeout,
        }
    }

    /// Build the upstream proxy URL for a descriptor. SOCKS credentials ride
    /// in the URL userinfo; HTTP credentials go through basic auth headers.
    fn build_proxy(proxy: &Proxy) -> Result<reqwest::Proxy, String> {
        let scheme = match proxy.protocol {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5h",
        };
        let mut url = Url::parse(&format!("{}://{}:{}", scheme, proxy.ip, proxy.port))
            .map_err(|e| format!("invalid proxy endpoint: {}", e))?;

        if proxy.protocol == ProxyProtocol::Socks5 {
            // SOCKS4 has no credential field in the protocol.
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                url.set_username(user).map_err(|_| "invalid proxy username".to_string())?;
                url.set_password(Some(pass)).map_err(|_| "invalid proxy password".to_string())?;
            }
        }

        let mut upstream = reqwest::Proxy::all(url.as_str())
            .map_err(|e| format!("invalid proxy URL: {}", e))?;

        if proxy.protocol == ProxyProtocol::Http {
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                upstream = upstream.basic_auth(user, pass);
            }
        }

        Ok(upstream)
    }

    fn build_client(&self, proxy: &Proxy) -> Result<Client, String> {
        let upstream = Self::build_proxy(proxy)?;
        Client::builder()
            .proxy(upstream)
            .timeout(self.timeout)
            .user_agent("Mozilla/5.0")
            .build()
            .map_err(|e| format!("failed to build probe client: {}", e))
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyProber for HttpProber {
    async fn probe(&self, proxy: &Proxy) -> ProbeReport {
        let client = match self.build_client(proxy) {
            Ok(client) => client,
            Err(e) => {
                warn!("[Prober] Proxy {} ({}:{}): {}", proxy.id, proxy.ip, proxy.port, e);
                return ProbeReport::down();
            }
        };

        let mut samples_ms: Vec<f64> = Vec::new();
        for url in &self.check_urls {
            let start = Instant::now();
            match client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let elapsed_ms = start.elapsed().as_millis() as f64;
                    samples_ms.push(elapsed_ms);
                    info!(
                        "[Prober] Proxy {} ({}:{}) -> {}: {:.0} ms",
                        proxy.id, proxy.ip, proxy.port, url, elapsed_ms
                    );
                }
                Ok(resp) => {
                    warn!(
                        "[Prober] Proxy {} ({}:{}) -> {}: status {}",
                        proxy.id, proxy.ip, proxy.port, url, resp.status()
                    );
                }
                Err(e) => {
                    warn!(
                        "[Prober] Proxy {} ({}:{}) -> {}: {}",
                        proxy.id, proxy.ip, proxy.port, url, e
                    );
                }
            }
        }

        if samples_ms.is_empty() {
            ProbeReport::down()
        } else {
            let avg = samples_ms.iter().sum::<f64>() / samples_ms.len() as f64;
            ProbeReport {
                status: ProxyStatus::Up,
                avg_response_ms: Some(avg.round()),
            }
        }
    }
}
