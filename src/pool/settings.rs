//! Settings registry: loads, caches, and atomically updates the pool
//! tunables.
//!
//! The cached snapshot is the only process-wide mutable state. Readers clone
//! an `Arc` out; updates replace the whole snapshot after the store write,
//! so a snapshot never changes under a reader.

use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::PoolError;
use crate::models::settings::{PoolSettings, SettingsPatch};
use crate::modules::store::ProxyStore;

#[derive(Clone)]
pub struct SettingsRegistry {
    store: ProxyStore,
    cached: Arc<RwLock<Arc<PoolSettings>>>,
}

impl SettingsRegistry {
    pub fn new(store: ProxyStore) -> Self {
        Self {
            store,
            cached: Arc::new(RwLock::new(Arc::new(PoolSettings::default()))),
        }
    }

    /// Read the settings document (writing defaults on first run) and refresh
    /// the cached snapshot.
    pub fn load(&self) -> Result<Arc<PoolSettings>, PoolError> {
        let settings = Arc::new(self.store.load_or_init_settings()?);
        *self.cached.write().expect("settings lock poisoned") = settings.clone();
        Ok(settings)
    }

    /// Current cached snapshot.
    pub fn snapshot(&self) -> Arc<PoolSettings> {
        self.cached.read().expect("settings lock poisoned").clone()
    }

    /// Apply a partial update, persist it, and reload the snapshot.
    pub fn update(&self, patch: &SettingsPatch) -> Result<Arc<PoolSettings>, PoolError> {
        if patch.is_empty() {
            return Err(PoolError::SettingsEmpty);
        }
        validate(patch)?;

        self.store.update_settings(patch)?;
        let settings = self.load()?;
        info!("[Settings] Updated: {:?}", settings);
        Ok(settings)
    }
}

fn validate(patch: &SettingsPatch) -> Result<(), PoolError> {
    if matches!(patch.max_instances_per_proxy, Some(0)) {
        return Err(PoolError::InvalidField(
            "max_instances_per_proxy must be at least 1".to_string(),
        ));
    }
    if matches!(patch.max_proxies_per_instance, Some(0)) {
        return Err(PoolError::InvalidField(
            "max_proxies_per_instance must be at least 1".to_string(),
        ));
    }
    if matches!(patch.background_check_proxies_interval, Some(0)) {
        return Err(PoolError::InvalidField(
            "background_check_proxies_interval must be at least 1 second".to_string(),
        ));
    }
    if matches!(patch.inactive_proxy_timeout, Some(t) if t < 1) {
        return Err(PoolError::InvalidField(
            "inactive_proxy_timeout must be at least 1 minute".to_string(),
        ));
    }
    if matches!(patch.threshold_time_minutes, Some(t) if t < 1) {
        return Err(PoolError::InvalidField(
            "threshold_time_minutes must be at least 1 minute".to_string(),
        ));
    }
    Ok(())
}
