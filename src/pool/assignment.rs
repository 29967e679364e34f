//! Assignment engine: atomic lease acquisition, release, and refresh.
//!
//! Assignment is per-document optimistic concurrency: read a candidate,
//! prune its stale leases, insert the new one, and compare-and-swap the
//! lease map against the snapshot that was read. A lost race retries with a
//! bounded attempt budget, so the capacity invariants hold without any
//! global lock and tolerate overlap with the prober and the expiry sweep.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::error::PoolError;
use crate::models::proxy::{prune_leases, AssignedProxy, Proxy, ProxyStatus};
use crate::modules::store::{ProxyFilter, ProxyStore};
use crate::pool::settings::SettingsRegistry;

/// Attempt budget for one assignment call. Each lost CAS race or
/// over-capacity candidate consumes one attempt.
const MAX_ASSIGN_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct AssignmentEngine {
    store: ProxyStore,
    settings: SettingsRegistry,
}

impl AssignmentEngine {
    pub fn new(store: ProxyStore, settings: SettingsRegistry) -> Self {
        Self { store, settings }
    }

    // ========================================================================
    // assign
    // ========================================================================

    /// Lease a proxy to `instance_id` under the capacity, tag, and country
    /// constraints.
    pub async fn assign(
        &self,
        instance_id: &str,
        country_code: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<AssignedProxy, PoolError> {
        let settings = self.settings.snapshot();

        let held = self.store.ids_holding_instance(instance_id)?;
        if held.len() >= settings.max_proxies_per_instance {
            return Err(PoolError::InstanceSaturated {
                instance_id: instance_id.to_string(),
                limit: settings.max_proxies_per_instance,
            });
        }

        let filter = ProxyFilter {
            status: Some(ProxyStatus::Up),
            country_code: country_code.map(|c| c.to_ascii_uppercase()),
            all_tags: tags.filter(|t| !t.is_empty()).map(|t| t.to_vec()),
            ..Default::default()
        };

        let mut excluded: HashSet<String> = HashSet::new();
        for _ in 0..MAX_ASSIGN_ATTEMPTS {
            let candidates = self.store.list_proxies(&filter)?;
            let now = Utc::now();
            let horizon = now - Duration::minutes(settings.inactive_proxy_timeout);

            let Some(candidate) = candidates
                .iter()
                .find(|p| !excluded.contains(&p.id) && !p.leases_malformed)
            else {
                break;
            };

            // Pre-prune stale leases before the capacity check, so leases the
            // expiry sweep has not reached yet never block fresh assignment.
            let mut leases = prune_leases(&candidate.instance_ids, horizon);
            leases.insert(instance_id.to_string(), now);

            if leases.len() > settings.max_instances_per_proxy {
                debug!(
                    "[Assign] Proxy {} is at capacity ({} live leases), skipping",
                    candidate.id,
                    candidate.lease_count()
                );
                excluded.insert(candidate.id.clone());
                continue;
            }

            if self.store.atomic_assign(
                &candidate.id,
                &candidate.raw_leases,
                &leases,
                ProxyStatus::Up,
            )? {
                self.store.touch_last_used(&candidate.id)?;
                info!(
                    "[Assign] Proxy {} assigned to instance {}",
                    candidate.id, instance_id
                );
                return Ok(AssignedProxy::from(candidate));
            }

            // A concurrent writer touched this document; re-read and retry.
            debug!(
                "[Assign] Lost assignment race on proxy {}, retrying",
                candidate.id
            );
        }

        Err(PoolError::NoProxyAvailable(no_proxy_message(
            country_code,
            tags,
        )))
    }

    // ========================================================================
    // refresh / clear
    // ========================================================================

    /// Refresh lease activity using the store-side clock. With an instance
    /// id, stamps that lease entry; without, stamps `last_used`.
    pub async fn refresh_usage(
        &self,
        proxy_id: &str,
        instance_id: Option<&str>,
    ) -> Result<(), PoolError> {
        let touched = match instance_id {
            Some(instance) => self.store.touch_lease(proxy_id, instance)?,
            None => self.store.touch_last_used(proxy_id)?,
        };
        if touched {
            Ok(())
        } else {
            Err(PoolError::NotFound(proxy_id.to_string()))
        }
    }

    /// Remove the instance's lease from every proxy holding it. Returns the
    /// ids of the proxies that were cleared.
    pub async fn clear_lease(&self, instance_id: &str) -> Result<Vec<String>, PoolError> {
        let holding = self.store.ids_holding_instance(instance_id)?;
        if holding.is_empty() {
            return Err(PoolError::NotHeld {
                instance_id: instance_id.to_string(),
            });
        }

        let mut cleared = Vec::new();
        for proxy_id in holding {
            if self.store.remove_lease(&proxy_id, instance_id)? {
                info!(
                    "[Assign] Cleared instance {} from proxy {}",
                    instance_id, proxy_id
                );
                cleared.push(proxy_id);
            }
        }
        Ok(cleared)
    }

    /// Remove a single (proxy, instance) lease entry.
    pub async fn clear_lease_on(
        &self,
        proxy_id: &str,
        instance_id: &str,
    ) -> Result<(), PoolError> {
        let proxy = self.load(proxy_id)?;
        if !proxy.holds_instance(instance_id) {
            return Err(PoolError::NotHeld {
                instance_id: instance_id.to_string(),
            });
        }
        self.store.remove_lease(proxy_id, instance_id)?;
        info!(
            "[Assign] Cleared instance {} from proxy {}",
            instance_id, proxy_id
        );
        Ok(())
    }

    fn load(&self, proxy_id: &str) -> Result<Proxy, PoolError> {
        self.store
            .get_proxy(proxy_id)?
            .ok_or_else(|| PoolError::NotFound(proxy_id.to_string()))
    }
}

fn no_proxy_message(country_code: Option<&str>, tags: Option<&[String]>) -> String {
    let mut message = "No available proxies found".to_string();
    if let Some(cc) = country_code {
        message.push_str(&format!(" for country code {}", cc));
    }
    if let Some(tags) = tags.filter(|t| !t.is_empty()) {
        if country_code.is_some() {
            message.push_str(&format!(" and tags {:?}", tags));
        } else {
            message.push_str(&format!(" for tags {:?}", tags));
        }
    }
    message
}

// ============================================================================
// Tests
// ============================================================================
