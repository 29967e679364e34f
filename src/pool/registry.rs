//! Proxy registry: CRUD over the proxy catalog.
//!
//! Inserts enforce the `(ip, port, protocol)` uniqueness invariant and edits
//! are restricted to a field whitelist. Both schedule an immediate
//! asynchronous probe of the (new) descriptor so the health state converges
//! without waiting for the next sweep.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{PoolError, StoreError};
use crate::models::proxy::{LeaseMap, Proxy, ProxyProtocol, ProxyStatus};
use crate::modules::store::{ProxyFilter, ProxyPatch, ProxyStore};
use crate::pool::prober::{probe_and_record, ProxyProber};

const EDITABLE_FIELDS: [&str; 7] = [
    "ip",
    "port",
    "username",
    "password",
    "protocol",
    "country_code",
    "tags",
];

// ============================================================================
// NewProxy - insertion descriptor
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct NewProxy {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Case-insensitive; defaults to HTTP.
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

// ============================================================================
// ProxyRegistry
// ============================================================================

#[derive(Clone)]
pub struct ProxyRegistry {
    store: ProxyStore,
    prober: Arc<dyn ProxyProber>,
}

impl ProxyRegistry {
    pub fn new(store: ProxyStore, prober: Arc<dyn ProxyProber>) -> Self {
        Self { store, prober }
    }

    /// Insert a proxy and schedule its first probe. Returns the fresh id.
    pub async fn add(&self, descriptor: NewProxy) -> Result<String, PoolError> {
        if descriptor.ip.trim().is_empty() {
            return Err(PoolError::InvalidField("ip must not be empty".to_string()));
        }
        if descriptor.port == 0 {
            return Err(PoolError::InvalidField(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        let protocol = match descriptor.protocol.as_deref() {
            Some(raw) => ProxyProtocol::from_str(raw).map_err(PoolError::InvalidField)?,
            None => ProxyProtocol::default(),
        };

        let proxy = Proxy {
            id: Uuid::new_v4().to_string(),
            ip: descriptor.ip,
            port: descriptor.port,
            username: descriptor.username,
            password: descriptor.password,
            protocol,
            response_time: None,
            status: ProxyStatus::Unknown,
            country_code: None,
            instance_ids: LeaseMap::new(),
            last_used: None,
            tags: descriptor.tags.unwrap_or_default(),
            raw_leases: "{}".to_string(),
            leases_malformed: false,
        };

        match self.store.insert_proxy(&proxy) {
            Ok(()) => {}
            Err(StoreError::Conflict) => return Err(PoolError::Duplicate),
            Err(e) => return Err(e.into()),
        }

        info!(
            "[Registry] Added proxy {} ({}:{} {})",
            proxy.id, proxy.ip, proxy.port, proxy.protocol
        );
        self.spawn_probe(proxy.clone());
        Ok(proxy.id)
    }

    /// Apply a whitelisted patch and schedule a probe of the new descriptor.
    /// Returns the updated fields and the updated record.
    pub async fn edit(
        &self,
        id: &str,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<(Vec<String>, Proxy), PoolError> {
        if self.store.get_proxy(id)?.is_none() {
            return Err(PoolError::NotFound(id.to_string()));
        }
        if fields.is_empty() {
            return Err(PoolError::InvalidField(
                "no valid fields were provided for update".to_string(),
            ));
        }

        let mut patch = ProxyPatch::default();
        let mut updated_fields = Vec::new();

        for (field, value) in fields {
            if !EDITABLE_FIELDS.contains(&field.as_str()) {
                return Err(PoolError::FieldForbidden(field.clone()));
            }
            if value.is_null() {
                return Err(PoolError::InvalidField(format!(
                    "value for field '{}' cannot be null",
                    field
                )));
            }
            match field.as_str() {
                "ip" => patch.ip = Some(expect_string(field, value)?),
                "port" => patch.port = Some(expect_port(value)?),
                "username" => patch.username = Some(expect_string(field, value)?),
                "password" => patch.password = Some(expect_string(field, value)?),
                "protocol" => {
                    let raw = expect_string(field, value)?;
                    patch.protocol =
                        Some(ProxyProtocol::from_str(&raw).map_err(PoolError::InvalidField)?);
                }
                "country_code" => patch.country_code = Some(expect_string(field, value)?),
                "tags" => patch.tags = Some(expect_tags(value)?),
                _ => unreachable!("field already validated against whitelist"),
            }
            updated_fields.push(field.clone());
        }

        match self.store.apply_patch(id, &patch) {
            Ok(true) => {}
            Ok(false) => return Err(PoolError::NotFound(id.to_string())),
            Err(StoreError::Conflict) => return Err(PoolError::Duplicate),
            Err(e) => return Err(e.into()),
        }

        let updated = self
            .store
            .get_proxy(id)?
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;

        info!("[Registry] Updated proxy {} fields {:?}", id, updated_fields);
        self.spawn_probe(updated.clone());
        Ok((updated_fields, updated))
    }

    pub fn delete(&self, id: &str) -> Result<(), PoolError> {
        if self.store.delete_proxy(id)? {
            info!("[Registry] Deleted proxy {}", id);
            Ok(())
        } else {
            Err(PoolError::NotFound(id.to_string()))
        }
    }

    pub fn get(&self, id: &str) -> Result<Proxy, PoolError> {
        self.store
            .get_proxy(id)?
            .ok_or_else(|| PoolError::NotFound(id.to_string()))
    }

    /// All proxies, optionally narrowed to those carrying any of `tags`.
    pub fn list(&self, tags: Option<Vec<String>>) -> Result<Vec<Proxy>, PoolError> {
        let filter = ProxyFilter {
            any_tags: tags.filter(|t| !t.is_empty()),
            ..Default::default()
        };
        Ok(self.store.list_proxies(&filter)?)
    }

    /// Clear every lease and `last_used` on all proxies.
    /// Returns (total proxies, proxies reset).
    pub fn reset_all_leases(&self) -> Result<(u64, u64), PoolError> {
        let (total, modified) = self.store.reset_all_leases()?;
        info!("[Registry] Reset leases on {} of {} proxies", modified, total);
        Ok((total, modified))
    }

    fn spawn_probe(&self, proxy: Proxy) {
        let store = self.store.clone();
        let prober = self.prober.clone();
        tokio::spawn(async move {
            probe_and_record(&store, prober.as_ref(), &proxy).await;
        });
    }
}

fn expect_string(field: &str, value: &Value) -> Result<String, PoolError> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| PoolError::InvalidField(format!("value for field '{}' must be a string", field)))
}

fn expect_port(value: &Value) -> Result<u16, PoolError> {
    value
        .as_u64()
        .filter(|p| (1..=65535).contains(p))
        .map(|p| p as u16)
        .ok_or_else(|| {
            PoolError::InvalidField("value for field 'port' must be an integer between 1 and 65535".to_string())
        })
}

fn expect_tags(value: &Value) -> Result<Vec<String>, PoolError> {
    let items = value
        .as_array()
        .ok_or_else(|| PoolError::InvalidField("value for field 'tags' must be a list".to_string()))?;
    items
        .iter()
        .map(|v| {
            v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                PoolError::InvalidField("value for field 'tags' must be a list of strings".to_string())
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::prober::ProbeReport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Prober double: counts probes, always reports UP at 42 ms.
    struct StubProber {
        probes: AtomicUsize,
    }

    impl StubProber {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProxyProber for StubProber {
        async fn probe(&self, _proxy: &Proxy) -> ProbeReport {
            self.probes.fetch_add(1, Ordering::SeqCst);
            ProbeReport {
                status: ProxyStatus::Up,
                avg_response_ms: Some(42.0),
            }
        }
    }

    fn test_registry() -> (TempDir, ProxyRegistry, Arc<StubProber>) {
        let dir = TempDir::new().unwrap();
        let store = ProxyStore::open(dir.path().join("fleet.db")).unwrap();
        let prober = StubProber::new();
        let registry = ProxyRegistry::new(store, prober.clone());
        (dir, registry, prober)
    }

    fn descriptor(ip: &str, port: u16, protocol: Option<&str>) -> NewProxy {
        NewProxy {
            ip: ip.to_string(),
            port,
            username: None,
            password: None,
            protocol: protocol.map(|p| p.to_string()),
            tags: None,
        }
    }

    async fn settle() {
        // Let spawned probe tasks run to completion.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    // ── Add ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_add_assigns_id_and_schedules_probe() {
        let (_dir, registry, prober) = test_registry();
        let id = registry
            .add(descriptor("1.2.3.4", 8080, Some("socks5")))
            .await
            .unwrap();
        settle().await;

        let proxy = registry.get(&id).unwrap();
        assert_eq!(proxy.protocol, ProxyProtocol::Socks5);
        // The scheduled probe wrote its result back.
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.status, ProxyStatus::Up);
        assert_eq!(proxy.response_time, Some(42.0));
    }

    #[tokio::test]
    async fn test_add_duplicate_rejected() {
        let (_dir, registry, _prober) = test_registry();
        registry
            .add(descriptor("1.2.3.4", 8080, Some("HTTP")))
            .await
            .unwrap();
        let err = registry
            .add(descriptor("1.2.3.4", 8080, Some("http")))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Duplicate));
    }

    #[tokio::test]
    async fn test_add_rejects_bad_protocol_and_port() {
        let (_dir, registry, _prober) = test_registry();
        assert!(matches!(
            registry
                .add(descriptor("1.2.3.4", 8080, Some("gopher")))
                .await
                .unwrap_err(),
            PoolError::InvalidField(_)
        ));
        assert!(matches!(
            registry.add(descriptor("1.2.3.4", 0, None)).await.unwrap_err(),
            PoolError::InvalidField(_)
        ));
    }

    // ── Edit ────────────────────────────────────────────────────────────

    fn fields(json: &str) -> serde_json::Map<String, Value> {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_edit_whitelisted_fields() {
        let (_dir, registry, prober) = test_registry();
        let id = registry.add(descriptor("1.2.3.4", 8080, None)).await.unwrap();
        settle().await;
        let probes_after_add = prober.probes.load(Ordering::SeqCst);

        let (updated_fields, proxy) = registry
            .edit(
                &id,
                &fields(r#"{"port": 9090, "tags": ["eu"], "country_code": "de"}"#),
            )
            .await
            .unwrap();
        settle().await;

        assert_eq!(updated_fields.len(), 3);
        assert_eq!(proxy.port, 9090);
        assert_eq!(proxy.tags, vec!["eu".to_string()]);
        assert_eq!(proxy.country_code.as_deref(), Some("DE"));
        // Edit schedules a fresh probe of the new descriptor.
        assert_eq!(prober.probes.load(Ordering::SeqCst), probes_after_add + 1);
    }

    #[tokio::test]
    async fn test_edit_forbidden_field() {
        let (_dir, registry, _prober) = test_registry();
        let id = registry.add(descriptor("1.2.3.4", 8080, None)).await.unwrap();

        let err = registry
            .edit(&id, &fields(r#"{"status": "UP"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::FieldForbidden(f) if f == "status"));
    }

    #[tokio::test]
    async fn test_edit_rejects_null_and_mistyped_values() {
        let (_dir, registry, _prober) = test_registry();
        let id = registry.add(descriptor("1.2.3.4", 8080, None)).await.unwrap();

        assert!(matches!(
            registry.edit(&id, &fields(r#"{"ip": null}"#)).await.unwrap_err(),
            PoolError::InvalidField(_)
        ));
        assert!(matches!(
            registry
                .edit(&id, &fields(r#"{"tags": "not-a-list"}"#))
                .await
                .unwrap_err(),
            PoolError::InvalidField(_)
        ));
        assert!(matches!(
            registry
                .edit(&id, &fields(r#"{"port": 70000}"#))
                .await
                .unwrap_err(),
            PoolError::InvalidField(_)
        ));
    }

    #[tokio::test]
    async fn test_edit_missing_proxy() {
        let (_dir, registry, _prober) = test_registry();
        let err = registry
            .edit("ghost", &fields(r#"{"port": 9090}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_edit_onto_existing_endpoint_is_duplicate() {
        let (_dir, registry, _prober) = test_registry();
        registry.add(descriptor("1.1.1.1", 8080, None)).await.unwrap();
        let id = registry.add(descriptor("2.2.2.2", 8080, None)).await.unwrap();

        let err = registry
            .edit(&id, &fields(r#"{"ip": "1.1.1.1"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Duplicate));
    }

    // ── Delete / list / reset ───────────────────────────────────────────

    #[tokio::test]
    async fn test_delete() {
        let (_dir, registry, _prober) = test_registry();
        let id = registry.add(descriptor("1.2.3.4", 8080, None)).await.unwrap();
        registry.delete(&id).unwrap();
        assert!(matches!(
            registry.delete(&id).unwrap_err(),
            PoolError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_list_any_of_tags() {
        let (_dir, registry, _prober) = test_registry();
        let mut a = descriptor("1.1.1.1", 8080, None);
        a.tags = Some(vec!["eu".into()]);
        let mut b = descriptor("2.2.2.2", 8080, None);
        b.tags = Some(vec!["us".into()]);
        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();

        assert_eq!(registry.list(None).unwrap().len(), 2);
        let eu = registry.list(Some(vec!["eu".into()])).unwrap();
        assert_eq!(eu.len(), 1);
        assert_eq!(eu[0].ip, "1.1.1.1");
        let either = registry
            .list(Some(vec!["eu".into(), "us".into()]))
            .unwrap();
        assert_eq!(either.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_all_leases() {
        let (_dir, registry, _prober) = test_registry();
        let id = registry.add(descriptor("1.2.3.4", 8080, None)).await.unwrap();
        // Plant a lease directly through the registry's store handle.
        registry.store.touch_lease(&id, "i1").unwrap();

        let (total, modified) = registry.reset_all_leases().unwrap();
        assert_eq!(total, 1);
        assert_eq!(modified, 1);
        assert!(registry.get(&id).unwrap().instance_ids.is_empty());
    }
}
