use serde::{Deserialize, Serialize};

// ============================================================================
// PoolSettings - the tunables governing the assignment engine and loops
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Lease staleness horizon (minutes) applied at assignment time.
    pub inactive_proxy_timeout: i64,
    /// Lease staleness horizon (minutes) applied by the expiry sweep.
    pub threshold_time_minutes: i64,
    /// Sleep (seconds) between health sweeps and between expiry sweeps.
    pub background_check_proxies_interval: u64,
    pub max_instances_per_proxy: usize,
    pub max_proxies_per_instance: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            inactive_proxy_timeout: 10,
            threshold_time_minutes: 10,
            background_check_proxies_interval: 60,
            max_instances_per_proxy: 2,
            max_proxies_per_instance: 1,
        }
    }
}

// ============================================================================
// SettingsPatch - partial replace-merge update
// ============================================================================

/// Fields absent from the patch are left untouched.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SettingsPatch {
    pub inactive_proxy_timeout: Option<i64>,
    pub threshold_time_minutes: Option<i64>,
    pub background_check_proxies_interval: Option<u64>,
    pub max_instances_per_proxy: Option<usize>,
    pub max_proxies_per_instance: Option<usize>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.inactive_proxy_timeout.is_none()
            && self.threshold_time_minutes.is_none()
            && self.background_check_proxies_interval.is_none()
            && self.max_instances_per_proxy.is_none()
            && self.max_proxies_per_instance.is_none()
    }

    /// `prev ⊕ patch`: the snapshot the store should hold after the update.
    pub fn apply(&self, prev: &PoolSettings) -> PoolSettings {
        PoolSettings {
            inactive_proxy_timeout: self
                .inactive_proxy_timeout
                .unwrap_or(prev.inactive_proxy_timeout),
            threshold_time_minutes: self
                .threshold_time_minutes
                .unwrap_or(prev.threshold_time_minutes),
            background_check_proxies_interval: self
                .background_check_proxies_interval
                .unwrap_or(prev.background_check_proxies_interval),
            max_instances_per_proxy: self
                .max_instances_per_proxy
                .unwrap_or(prev.max_instances_per_proxy),
            max_proxies_per_instance: self
                .max_proxies_per_instance
                .unwrap_or(prev.max_proxies_per_instance),
        }
    }
}
