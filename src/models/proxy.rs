use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ProxyProtocol
// ============================================================================

/// Tunnel protocol spoken to the upstream proxy. Input is case-insensitive
/// and canonicalized to the uppercase wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyProtocol {
    Http,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "HTTP",
            ProxyProtocol::Socks4 => "SOCKS4",
            ProxyProtocol::Socks5 => "SOCKS5",
        }
    }
}

impl Default for ProxyProtocol {
    fn default() -> Self {
        Self::Http
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(ProxyProtocol::Http),
            "SOCKS4" => Ok(ProxyProtocol::Socks4),
            "SOCKS5" => Ok(ProxyProtocol::Socks5),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

// ============================================================================
// ProxyStatus
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyStatus {
    Unknown,
    Up,
    Down,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Unknown => "UNKNOWN",
            ProxyStatus::Up => "UP",
            ProxyStatus::Down => "DOWN",
        }
    }
}

impl Default for ProxyStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(ProxyStatus::Unknown),
            "UP" => Ok(ProxyStatus::Up),
            "DOWN" => Ok(ProxyStatus::Down),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

// ============================================================================
// Leases
// ============================================================================

/// Live leases on a proxy: instance id → last_seen (UTC).
///
/// BTreeMap keeps JSON encoding deterministic, so two writers that hold the
/// same logical map produce the same stored text.
pub type LeaseMap = BTreeMap<String, DateTime<Utc>>;

/// Drop every lease whose last_seen is at or before `horizon`.
pub fn prune_leases(leases: &LeaseMap, horizon: DateTime<Utc>) -> LeaseMap {
    leases
        .iter()
        .filter(|(_, seen)| **seen > horizon)
        .map(|(id, seen)| (id.clone(), *seen))
        .collect()
}

// ============================================================================
// Proxy
// ============================================================================

/// A proxy document as stored in the `proxies` collection.
#[derive(Debug, Clone, Serialize)]
pub struct Proxy {
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub protocol: ProxyProtocol,
    /// Average response time of the last probe in milliseconds; None until
    /// probed, or when no probe URL succeeded.
    pub response_time: Option<f64>,
    pub status: ProxyStatus,
    pub country_code: Option<String>,
    pub instance_ids: LeaseMap,
    pub last_used: Option<DateTime<Utc>>,
    pub tags: Vec<String>,

    /// Exact `instance_ids` text read from the store. The assignment CAS
    /// compares against this, so the swap only lands if nobody wrote the
    /// document in between.
    #[serde(skip)]
    pub raw_leases: String,
    /// Set when the stored `instance_ids` was not a JSON object. Such
    /// proxies are skipped by the sweeps and never selected for assignment.
    #[serde(skip)]
    pub leases_malformed: bool,
}

impl Proxy {
    pub fn lease_count(&self) -> usize {
        self.instance_ids.len()
    }

    pub fn holds_instance(&self, instance_id: &str) -> bool {
        self.instance_ids.contains_key(instance_id)
    }
}

// ============================================================================
// AssignedProxy - payload returned from a successful assignment
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AssignedProxy {
    pub proxy_id: String,
    pub ip: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol: ProxyProtocol,
}

impl From<&Proxy> for AssignedProxy {
    fn from(p: &Proxy) -> Self {
        Self {
            proxy_id: p.id.clone(),
            ip: p.ip.clone(),
            port: p.port,
            username: p.username.clone(),
            password: p.password.clone(),
            protocol: p.protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn test_protocol_parse_is_case_insensitive() {
        assert_eq!("http".parse::<ProxyProtocol>().unwrap(), ProxyProtocol::Http);
        assert_eq!("Socks4".parse::<ProxyProtocol>().unwrap(), ProxyProtocol::Socks4);
        assert_eq!("SOCKS5".parse::<ProxyProtocol>().unwrap(), ProxyProtocol::Socks5);
        assert!("socks6".parse::<ProxyProtocol>().is_err());
    }

    #[test]
    fn test_protocol_serializes_canonical_upper() {
        let json = serde_json::to_string(&ProxyProtocol::Socks5).unwrap();
        assert_eq!(json, "\"SOCKS5\"");
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [ProxyStatus::Unknown, ProxyStatus::Up, ProxyStatus::Down] {
            assert_eq!(s.as_str().parse::<ProxyStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_prune_drops_stale_keeps_fresh() {
        let now = Utc::now();
        let mut leases = LeaseMap::new();
        leases.insert("stale".into(), now - Duration::minutes(11));
        leases.insert("fresh".into(), now - Duration::minutes(1));

        let pruned = prune_leases(&leases, now - Duration::minutes(10));
        assert_eq!(pruned.len(), 1);
        assert!(pruned.contains_key("fresh"));
    }

    #[test]
    fn test_lease_map_encoding_is_deterministic() {
        let now = Utc::now();
        let mut a = LeaseMap::new();
        a.insert("zeta".into(), now);
        a.insert("alpha".into(), now);

        let mut b = LeaseMap::new();
        b.insert("alpha".into(), now);
        b.insert("zeta".into(), now);

        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    proptest! {
        /// Pruning keeps exactly the entries newer than the horizon, and
        /// pruning twice is the same as pruning once.
        #[test]
        fn prop_prune_keeps_exactly_fresh(offsets in proptest::collection::vec(-120i64..120, 0..16)) {
            let now = Utc::now();
            let horizon = now - Duration::minutes(10);

            let leases: LeaseMap = offsets
                .iter()
                .enumerate()
                .map(|(i, mins)| (format!("i{}", i), now + Duration::minutes(*mins)))
                .collect();

            let pruned = prune_leases(&leases, horizon);
            for (id, seen) in &leases {
                prop_assert_eq!(pruned.contains_key(id), *seen > horizon);
            }
            prop_assert_eq!(prune_leases(&pruned, horizon), pruned.clone());
        }
    }
}
