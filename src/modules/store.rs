//! SQLite-backed document store for proxies, settings, and users.
//!
//! The store is the system of record: no proxy state is cached in memory.
//! Each operation opens its own connection (WAL + busy_timeout), so callers
//! never share a connection across suspension points. Lease field-path
//! updates go through SQLite's JSON1 functions; the assignment path uses a
//! compare-and-swap on the raw `instance_ids` text for optimistic
//! concurrency.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::warn;

use crate::error::StoreError;
use crate::models::proxy::{LeaseMap, Proxy, ProxyProtocol, ProxyStatus};
use crate::models::settings::{PoolSettings, SettingsPatch};

// ============================================================================
// Filters & patches
// ============================================================================

/// Query filter for `list_proxies`. Status and country are pushed into SQL;
/// tag matching happens on the decoded rows.
#[derive(Debug, Clone, Default)]
pub struct ProxyFilter {
    pub status: Option<ProxyStatus>,
    pub country_code: Option<String>,
    /// Match proxies carrying at least one of these tags.
    pub any_tags: Option<Vec<String>>,
    /// Match proxies carrying every one of these tags.
    pub all_tags: Option<Vec<String>>,
}

/// Set-style partial update of the editable proxy fields.
#[derive(Debug, Clone, Default)]
pub struct ProxyPatch {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol: Option<ProxyProtocol>,
    pub country_code: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl ProxyPatch {
    pub fn is_empty(&self) -> bool {
        self.ip.is_none()
            && self.port.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.protocol.is_none()
            && self.country_code.is_none()
            && self.tags.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
}

// ============================================================================
// Lease encoding
// ============================================================================

pub fn encode_leases(leases: &LeaseMap) -> String {
    // BTreeMap of string/timestamp cannot fail to serialize.
    serde_json::to_string(leases).unwrap_or_else(|_| "{}".to_string())
}

fn decode_leases(raw: &str) -> Option<LeaseMap> {
    serde_json::from_str(raw).ok()
}

/// JSON1 path addressing a single lease key, with quote escaping so opaque
/// instance ids cannot break out of the path literal.
fn lease_path(instance_id: &str) -> String {
    format!(
        "$.\"{}\"",
        instance_id.replace('\\', "\\\\").replace('"', "\\\"")
    )
}

// Millisecond-precision UTC timestamp generated inside SQLite, so refresh
// operations are immune to caller clock skew.
const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

// ============================================================================
// ProxyStore
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProxyStore {
    db_path: PathBuf,
}

impl ProxyStore {
    /// Open the store and ensure the schema exists.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        let conn = store.connect()?;
        init_schema(&conn)?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    // ========================================================================
    // Proxy CRUD
    // ========================================================================

    pub fn insert_proxy(&self, proxy: &Proxy) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let tags = serde_json::to_string(&proxy.tags).unwrap_or_else(|_| "[]".to_string());
        let result = conn.execute(
            "INSERT INTO proxies (id, ip, port, username, password, protocol,
                                  response_time, status, country_code,
                                  instance_ids, last_used, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                proxy.id,
                proxy.ip,
                proxy.port as i64,
                proxy.username,
                proxy.password,
                proxy.protocol.as_str(),
                proxy.response_time,
                proxy.status.as_str(),
                proxy.country_code,
                encode_leases(&proxy.instance_ids),
                proxy.last_used.map(|t| t.to_rfc3339()),
                tags,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_proxy(&self, id: &str) -> Result<Option<Proxy>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_PROXY))?;
        let mut rows = stmt.query_map(params![id], row_to_proxy)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_proxies(&self, filter: &ProxyFilter) -> Result<Vec<Proxy>, StoreError> {
        let conn = self.connect()?;

        let mut sql = format!("{} WHERE 1=1", SELECT_PROXY);
        let mut binds: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(cc) = &filter.country_code {
            sql.push_str(" AND country_code = ?");
            binds.push(cc.to_ascii_uppercase());
        }
        sql.push_str(" ORDER BY ip, port");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds.iter()), row_to_proxy)?;

        let mut proxies = Vec::new();
        for row in rows {
            let proxy = row?;
            if let Some(any) = &filter.any_tags {
                if !any.iter().any(|t| proxy.tags.contains(t)) {
                    continue;
                }
            }
            if let Some(all) = &filter.all_tags {
                if !all.iter().all(|t| proxy.tags.contains(t)) {
                    continue;
                }
            }
            proxies.push(proxy);
        }
        Ok(proxies)
    }

    /// Apply an edit patch. Returns false when the proxy does not exist.
    pub fn apply_patch(&self, id: &str, patch: &ProxyPatch) -> Result<bool, StoreError> {
        if patch.is_empty() {
            return Ok(self.get_proxy(id)?.is_some());
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(ip) = &patch.ip {
            sets.push("ip = ?");
            binds.push(Box::new(ip.clone()));
        }
        if let Some(port) = patch.port {
            sets.push("port = ?");
            binds.push(Box::new(port as i64));
        }
        if let Some(username) = &patch.username {
            sets.push("username = ?");
            binds.push(Box::new(username.clone()));
        }
        if let Some(password) = &patch.password {
            sets.push("password = ?");
            binds.push(Box::new(password.clone()));
        }
        if let Some(protocol) = patch.protocol {
            sets.push("protocol = ?");
            binds.push(Box::new(protocol.as_str()));
        }
        if let Some(cc) = &patch.country_code {
            sets.push("country_code = ?");
            binds.push(Box::new(cc.to_ascii_uppercase()));
        }
        if let Some(tags) = &patch.tags {
            sets.push("tags = ?");
            binds.push(Box::new(
                serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string()),
            ));
        }
        binds.push(Box::new(id.to_string()));

        let sql = format!(
            "UPDATE proxies SET {} WHERE id = ?",
            sets.join(", ")
        );
        let conn = self.connect()?;
        match conn.execute(&sql, params_from_iter(binds.iter().map(|b| b.as_ref()))) {
            Ok(n) => Ok(n == 1),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_proxy(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let n = conn.execute("DELETE FROM proxies WHERE id = ?1", params![id])?;
        Ok(n == 1)
    }

    // ========================================================================
    // Probe / enrichment write-backs
    // ========================================================================

    pub fn set_probe_result(
        &self,
        id: &str,
        status: ProxyStatus,
        response_time: Option<f64>,
    ) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let n = conn.execute(
            "UPDATE proxies SET status = ?1, response_time = ?2 WHERE id = ?3",
            params![status.as_str(), response_time, id],
        )?;
        Ok(n == 1)
    }

    pub fn set_country_code(&self, id: &str, country_code: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let n = conn.execute(
            "UPDATE proxies SET country_code = ?1 WHERE id = ?2",
            params![country_code.to_ascii_uppercase(), id],
        )?;
        Ok(n == 1)
    }

    // ========================================================================
    // Lease operations
    // ========================================================================

    /// Conditionally replace the lease map. The write lands only if the
    /// stored text still equals `expected_raw` and the proxy still has the
    /// required status; returns whether it did.
    pub fn atomic_assign(
        &self,
        id: &str,
        expected_raw: &str,
        new_leases: &LeaseMap,
        required_status: ProxyStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let n = conn.execute(
            "UPDATE proxies SET instance_ids = ?1
             WHERE id = ?2 AND status = ?3 AND instance_ids = ?4",
            params![
                encode_leases(new_leases),
                id,
                required_status.as_str(),
                expected_raw
            ],
        )?;
        Ok(n == 1)
    }

    /// Stamp `instance_ids[instance_id]` with the store-side current time,
    /// inserting the entry when absent. No-op on malformed lease documents.
    pub fn touch_lease(&self, id: &str, instance_id: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let sql = format!(
            "UPDATE proxies SET instance_ids = json_set(instance_ids, ?1, {})
             WHERE id = ?2 AND json_type(instance_ids) = 'object'",
            SQL_NOW
        );
        let n = conn.execute(&sql, params![lease_path(instance_id), id])?;
        Ok(n == 1)
    }

    /// Stamp `last_used` with the store-side current time.
    pub fn touch_last_used(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let sql = format!("UPDATE proxies SET last_used = {} WHERE id = ?1", SQL_NOW);
        let n = conn.execute(&sql, params![id])?;
        Ok(n == 1)
    }

    /// Remove a single lease entry. Guarded so a malformed lease document is
    /// never rewritten.
    pub fn remove_lease(&self, id: &str, instance_id: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let n = conn.execute(
            "UPDATE proxies SET instance_ids = json_remove(instance_ids, ?1)
             WHERE id = ?2 AND json_type(instance_ids) = 'object'",
            params![lease_path(instance_id), id],
        )?;
        Ok(n == 1)
    }

    /// Remove a batch of expired lease entries in one atomic update,
    /// clearing `last_used` in the same write when the map empties.
    pub fn remove_expired_leases(
        &self,
        id: &str,
        expired: &[String],
        clear_last_used: bool,
    ) -> Result<bool, StoreError> {
        if expired.is_empty() {
            return Ok(false);
        }
        let paths = vec!["?"; expired.len()].join(", ");
        let last_used = if clear_last_used { ", last_used = NULL" } else { "" };
        let sql = format!(
            "UPDATE proxies SET instance_ids = json_remove(instance_ids, {}){}
             WHERE id = ? AND json_type(instance_ids) = 'object'",
            paths, last_used
        );

        let mut binds: Vec<String> = expired.iter().map(|i| lease_path(i)).collect();
        binds.push(id.to_string());

        let conn = self.connect()?;
        let n = conn.execute(&sql, params_from_iter(binds.iter()))?;
        Ok(n == 1)
    }

    /// Ids of every proxy currently holding a lease for the instance.
    pub fn ids_holding_instance(&self, instance_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM proxies
             WHERE json_type(instance_ids) = 'object'
               AND EXISTS (SELECT 1 FROM json_each(proxies.instance_ids)
                           WHERE json_each.key = ?1)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![instance_id], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Clear every lease and `last_used` on all proxies.
    /// Returns (total proxies, proxies actually reset).
    pub fn reset_all_leases(&self) -> Result<(u64, u64), StoreError> {
        let conn = self.connect()?;
        let total = conn.query_row("SELECT COUNT(*) FROM proxies", [], |row| row.get::<_, i64>(0))?
            as u64;
        let modified = conn.execute(
            "UPDATE proxies SET instance_ids = '{}', last_used = NULL
             WHERE instance_ids <> '{}' OR last_used IS NOT NULL",
            [],
        )?;
        Ok((total, modified as u64))
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Read the settings document, writing defaults first if none exists.
    pub fn load_or_init_settings(&self) -> Result<PoolSettings, StoreError> {
        let conn = self.connect()?;
        let existing = conn
            .query_row(
                "SELECT inactive_proxy_timeout, threshold_time_minutes,
                        background_check_proxies_interval,
                        max_instances_per_proxy, max_proxies_per_instance
                 FROM proxy_manager_settings WHERE id = 1",
                [],
                |row| {
                    Ok(PoolSettings {
                        inactive_proxy_timeout: row.get(0)?,
                        threshold_time_minutes: row.get(1)?,
                        background_check_proxies_interval: row.get::<_, i64>(2)? as u64,
                        max_instances_per_proxy: row.get::<_, i64>(3)? as usize,
                        max_proxies_per_instance: row.get::<_, i64>(4)? as usize,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some(settings) = existing {
            return Ok(settings);
        }

        let defaults = PoolSettings::default();
        conn.execute(
            "INSERT INTO proxy_manager_settings
                 (id, inactive_proxy_timeout, threshold_time_minutes,
                  background_check_proxies_interval,
                  max_instances_per_proxy, max_proxies_per_instance)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                defaults.inactive_proxy_timeout,
                defaults.threshold_time_minutes,
                defaults.background_check_proxies_interval as i64,
                defaults.max_instances_per_proxy as i64,
                defaults.max_proxies_per_instance as i64,
            ],
        )?;
        Ok(defaults)
    }

    /// Persist a partial settings update (upsert).
    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<(), StoreError> {
        let prev = self.load_or_init_settings()?;
        let next = patch.apply(&prev);
        let conn = self.connect()?;
        conn.execute(
            "UPDATE proxy_manager_settings
             SET inactive_proxy_timeout = ?1,
                 threshold_time_minutes = ?2,
                 background_check_proxies_interval = ?3,
                 max_instances_per_proxy = ?4,
                 max_proxies_per_instance = ?5
             WHERE id = 1",
            params![
                next.inactive_proxy_timeout,
                next.threshold_time_minutes,
                next.background_check_proxies_interval as i64,
                next.max_instances_per_proxy as i64,
                next.max_proxies_per_instance as i64,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.connect()?;
        let user = conn
            .query_row(
                "SELECT username, password_hash FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(UserRecord {
                        username: row.get(0)?,
                        password_hash: row.get(1)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(user)
    }

    /// Create the user unless one already exists. Returns whether a row was
    /// inserted.
    pub fn insert_user_if_absent(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO users (username, password_hash) VALUES (?1, ?2)",
            params![username, password_hash],
        )?;
        Ok(n == 1)
    }

    pub fn set_user_password(&self, username: &str, password_hash: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let n = conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE username = ?2",
            params![password_hash, username],
        )?;
        Ok(n == 1)
    }
}

// ============================================================================
// Schema & row mapping
// ============================================================================

const SELECT_PROXY: &str = "SELECT id, ip, port, username, password, protocol,
        response_time, status, country_code, instance_ids, last_used, tags
 FROM proxies";

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS proxies (
            id TEXT PRIMARY KEY,
            ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            username TEXT,
            password TEXT,
            protocol TEXT NOT NULL,
            response_time REAL,
            status TEXT NOT NULL DEFAULT 'UNKNOWN',
            country_code TEXT,
            instance_ids TEXT NOT NULL DEFAULT '{}',
            last_used TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            UNIQUE (ip, port, protocol)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_proxies_status ON proxies (status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_proxies_country ON proxies (country_code)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS proxy_manager_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            inactive_proxy_timeout INTEGER NOT NULL,
            threshold_time_minutes INTEGER NOT NULL,
            background_check_proxies_interval INTEGER NOT NULL,
            max_instances_per_proxy INTEGER NOT NULL,
            max_proxies_per_instance INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            password_hash TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
    })
}

fn row_to_proxy(row: &Row) -> rusqlite::Result<Proxy> {
    let id: String = row.get(0)?;
    let protocol_raw: String = row.get(5)?;
    let status_raw: String = row.get(7)?;
    let raw_leases: String = row.get(9)?;
    let tags_raw: String = row.get(11)?;

    let (instance_ids, leases_malformed) = match decode_leases(&raw_leases) {
        Some(map) => (map, false),
        None => {
            warn!(
                "[Store] instance_ids in proxy {} is not a mapping, leaving untouched: {}",
                id, raw_leases
            );
            (LeaseMap::new(), true)
        }
    };

    Ok(Proxy {
        id,
        ip: row.get(1)?,
        port: row.get::<_, i64>(2)? as u16,
        username: row.get(3)?,
        password: row.get(4)?,
        protocol: protocol_raw.parse().unwrap_or_default(),
        response_time: row.get(6)?,
        status: status_raw.parse().unwrap_or_default(),
        country_code: row.get(8)?,
        instance_ids,
        last_used: parse_timestamp(row.get(10)?),
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        raw_leases,
        leases_malformed,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, ProxyStore) {
        let dir = TempDir::new().unwrap();
        let store = ProxyStore::open(dir.path().join("fleet.db")).unwrap();
        (dir, store)
    }

    fn make_proxy(id: &str, ip: &str, port: u16) -> Proxy {
        Proxy {
            id: id.to_string(),
            ip: ip.to_string(),
            port,
            username: None,
            password: None,
            protocol: ProxyProtocol::Http,
            response_time: None,
            status: ProxyStatus::Unknown,
            country_code: None,
            instance_ids: LeaseMap::new(),
            last_used: None,
            tags: vec![],
            raw_leases: "{}".to_string(),
            leases_malformed: false,
        }
    }

    // ── Insert / uniqueness ─────────────────────────────────────────────

    #[test]
    fn test_insert_and_get_roundtrip() {
        let (_dir, store) = test_store();
        let mut proxy = make_proxy("p1", "1.2.3.4", 8080);
        proxy.tags = vec!["eu".into(), "fast".into()];
        store.insert_proxy(&proxy).unwrap();

        let loaded = store.get_proxy("p1").unwrap().unwrap();
        assert_eq!(loaded.ip, "1.2.3.4");
        assert_eq!(loaded.port, 8080);
        assert_eq!(loaded.status, ProxyStatus::Unknown);
        assert_eq!(loaded.tags, vec!["eu".to_string(), "fast".to_string()]);
        assert!(loaded.instance_ids.is_empty());
        assert_eq!(loaded.raw_leases, "{}");
    }

    #[test]
    fn test_duplicate_endpoint_conflicts() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();
        let err = store
            .insert_proxy(&make_proxy("p2", "1.2.3.4", 8080))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[test]
    fn test_same_endpoint_different_protocol_allowed() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();
        let mut socks = make_proxy("p2", "1.2.3.4", 8080);
        socks.protocol = ProxyProtocol::Socks5;
        store.insert_proxy(&socks).unwrap();
    }

    // ── Filters ─────────────────────────────────────────────────────────

    #[test]
    fn test_list_filters_status_country_tags() {
        let (_dir, store) = test_store();
        let mut us = make_proxy("p1", "1.1.1.1", 1000);
        us.status = ProxyStatus::Up;
        us.country_code = Some("US".into());
        us.tags = vec!["a".into(), "b".into()];
        let mut fr = make_proxy("p2", "2.2.2.2", 1000);
        fr.status = ProxyStatus::Up;
        fr.country_code = Some("FR".into());
        fr.tags = vec!["b".into()];
        let mut down = make_proxy("p3", "3.3.3.3", 1000);
        down.status = ProxyStatus::Down;
        store.insert_proxy(&us).unwrap();
        store.insert_proxy(&fr).unwrap();
        store.insert_proxy(&down).unwrap();

        let up = store
            .list_proxies(&ProxyFilter {
                status: Some(ProxyStatus::Up),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(up.len(), 2);

        // Country matching is case-insensitive on input.
        let fr_only = store
            .list_proxies(&ProxyFilter {
                country_code: Some("fr".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(fr_only.len(), 1);
        assert_eq!(fr_only[0].id, "p2");

        let all_ab = store
            .list_proxies(&ProxyFilter {
                all_tags: Some(vec!["a".into(), "b".into()]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all_ab.len(), 1);
        assert_eq!(all_ab[0].id, "p1");

        let any_b = store
            .list_proxies(&ProxyFilter {
                any_tags: Some(vec!["b".into()]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(any_b.len(), 2);
    }

    // ── Patch ───────────────────────────────────────────────────────────

    #[test]
    fn test_apply_patch_updates_fields() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();

        let changed = store
            .apply_patch(
                "p1",
                &ProxyPatch {
                    port: Some(9090),
                    country_code: Some("de".into()),
                    tags: Some(vec!["x".into()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(changed);

        let loaded = store.get_proxy("p1").unwrap().unwrap();
        assert_eq!(loaded.port, 9090);
        assert_eq!(loaded.country_code.as_deref(), Some("DE"));
        assert_eq!(loaded.tags, vec!["x".to_string()]);
    }

    #[test]
    fn test_apply_patch_missing_proxy() {
        let (_dir, store) = test_store();
        let changed = store
            .apply_patch(
                "ghost",
                &ProxyPatch {
                    port: Some(9090),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_apply_patch_onto_existing_endpoint_conflicts() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();
        store.insert_proxy(&make_proxy("p2", "5.6.7.8", 8080)).unwrap();

        let err = store
            .apply_patch(
                "p2",
                &ProxyPatch {
                    ip: Some("1.2.3.4".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    // ── Lease CAS ───────────────────────────────────────────────────────

    #[test]
    fn test_atomic_assign_lands_once() {
        let (_dir, store) = test_store();
        let mut proxy = make_proxy("p1", "1.2.3.4", 8080);
        proxy.status = ProxyStatus::Up;
        store.insert_proxy(&proxy).unwrap();

        let loaded = store.get_proxy("p1").unwrap().unwrap();
        let mut leases = LeaseMap::new();
        leases.insert("i1".into(), Utc::now());

        assert!(store
            .atomic_assign("p1", &loaded.raw_leases, &leases, ProxyStatus::Up)
            .unwrap());

        // Second writer holding the original snapshot loses the race.
        assert!(!store
            .atomic_assign("p1", &loaded.raw_leases, &leases, ProxyStatus::Up)
            .unwrap());

        let after = store.get_proxy("p1").unwrap().unwrap();
        assert!(after.holds_instance("i1"));
    }

    #[test]
    fn test_atomic_assign_requires_status() {
        let (_dir, store) = test_store();
        let proxy = make_proxy("p1", "1.2.3.4", 8080); // UNKNOWN
        store.insert_proxy(&proxy).unwrap();

        let loaded = store.get_proxy("p1").unwrap().unwrap();
        let mut leases = LeaseMap::new();
        leases.insert("i1".into(), Utc::now());
        assert!(!store
            .atomic_assign("p1", &loaded.raw_leases, &leases, ProxyStatus::Up)
            .unwrap());
    }

    // ── Lease touch / remove ────────────────────────────────────────────

    #[test]
    fn test_touch_lease_inserts_server_side_timestamp() {
        let (_dir, store) = test_store();
        let mut proxy = make_proxy("p1", "1.2.3.4", 8080);
        proxy.status = ProxyStatus::Up;
        store.insert_proxy(&proxy).unwrap();

        assert!(store.touch_lease("p1", "i1").unwrap());
        let loaded = store.get_proxy("p1").unwrap().unwrap();
        let seen = loaded.instance_ids.get("i1").copied().unwrap();
        assert!((Utc::now() - seen).num_seconds().abs() < 5);
    }

    #[test]
    fn test_touch_lease_refresh_is_idempotent_at_latest() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();

        for _ in 0..3 {
            assert!(store.touch_lease("p1", "i1").unwrap());
        }
        let loaded = store.get_proxy("p1").unwrap().unwrap();
        assert_eq!(loaded.lease_count(), 1);
        let seen = loaded.instance_ids.get("i1").copied().unwrap();
        assert!((Utc::now() - seen).num_seconds().abs() < 5);
    }

    #[test]
    fn test_touch_last_used() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();
        assert!(store.touch_last_used("p1").unwrap());
        let loaded = store.get_proxy("p1").unwrap().unwrap();
        assert!(loaded.last_used.is_some());
    }

    #[test]
    fn test_remove_lease() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();
        store.touch_lease("p1", "i1").unwrap();
        store.touch_lease("p1", "i2").unwrap();

        assert!(store.remove_lease("p1", "i1").unwrap());
        let loaded = store.get_proxy("p1").unwrap().unwrap();
        assert!(!loaded.holds_instance("i1"));
        assert!(loaded.holds_instance("i2"));
    }

    #[test]
    fn test_remove_lease_skips_malformed_document() {
        let (dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();

        // Corrupt the lease document out-of-band.
        let conn = Connection::open(dir.path().join("fleet.db")).unwrap();
        conn.execute(
            "UPDATE proxies SET instance_ids = '[\"not\",\"a\",\"map\"]' WHERE id = 'p1'",
            [],
        )
        .unwrap();

        assert!(!store.remove_lease("p1", "i1").unwrap());
        let loaded = store.get_proxy("p1").unwrap().unwrap();
        assert!(loaded.leases_malformed);
        assert_eq!(loaded.raw_leases, "[\"not\",\"a\",\"map\"]");
    }

    #[test]
    fn test_remove_expired_clears_last_used_when_emptied() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.2.3.4", 8080)).unwrap();
        store.touch_lease("p1", "i1").unwrap();
        store.touch_last_used("p1").unwrap();

        assert!(store
            .remove_expired_leases("p1", &["i1".to_string()], true)
            .unwrap());
        let loaded = store.get_proxy("p1").unwrap().unwrap();
        assert!(loaded.instance_ids.is_empty());
        assert!(loaded.last_used.is_none());
    }

    #[test]
    fn test_ids_holding_instance() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.1.1.1", 1000)).unwrap();
        store.insert_proxy(&make_proxy("p2", "2.2.2.2", 1000)).unwrap();
        store.insert_proxy(&make_proxy("p3", "3.3.3.3", 1000)).unwrap();
        store.touch_lease("p1", "i1").unwrap();
        store.touch_lease("p3", "i1").unwrap();
        store.touch_lease("p2", "other").unwrap();

        let ids = store.ids_holding_instance("i1").unwrap();
        assert_eq!(ids, vec!["p1".to_string(), "p3".to_string()]);
    }

    #[test]
    fn test_reset_all_leases_counts() {
        let (_dir, store) = test_store();
        store.insert_proxy(&make_proxy("p1", "1.1.1.1", 1000)).unwrap();
        store.insert_proxy(&make_proxy("p2", "2.2.2.2", 1000)).unwrap();
        store.touch_lease("p1", "i1").unwrap();

        let (total, modified) = store.reset_all_leases().unwrap();
        assert_eq!(total, 2);
        assert_eq!(modified, 1);

        let (total, modified) = store.reset_all_leases().unwrap();
        assert_eq!(total, 2);
        assert_eq!(modified, 0);
    }

    // ── Settings ────────────────────────────────────────────────────────

    #[test]
    fn test_settings_lazy_defaults() {
        let (_dir, store) = test_store();
        let settings = store.load_or_init_settings().unwrap();
        assert_eq!(settings, PoolSettings::default());
        // Second load reads the persisted row.
        assert_eq!(store.load_or_init_settings().unwrap(), settings);
    }

    #[test]
    fn test_settings_update_roundtrip() {
        let (_dir, store) = test_store();
        let prev = store.load_or_init_settings().unwrap();
        let patch = SettingsPatch {
            max_instances_per_proxy: Some(7),
            ..Default::default()
        };
        store.update_settings(&patch).unwrap();

        let next = store.load_or_init_settings().unwrap();
        assert_eq!(next, patch.apply(&prev));
    }

    // ── Users ───────────────────────────────────────────────────────────

    #[test]
    fn test_user_bootstrap_and_password_change() {
        let (_dir, store) = test_store();
        assert!(store.insert_user_if_absent("admin", "hash-1").unwrap());
        assert!(!store.insert_user_if_absent("admin", "hash-2").unwrap());

        let user = store.get_user("admin").unwrap().unwrap();
        assert_eq!(user.password_hash, "hash-1");

        assert!(store.set_user_password("admin", "hash-3").unwrap());
        let user = store.get_user("admin").unwrap().unwrap();
        assert_eq!(user.password_hash, "hash-3");
        assert!(store.get_user("nobody").unwrap().is_none());
    }
}
