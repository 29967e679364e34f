//! Country lookup over a MaxMind GeoLite2 database.
//!
//! Lookups are blocking; the enrichment loop calls them through
//! `spawn_blocking`. A missing database file is not fatal: the reader is
//! re-opened lazily, so enrichment recovers as soon as the file appears.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::RwLock;

use maxminddb::{geoip2, Reader};
use tracing::{info, warn};

use crate::error::LookupError;

/// Maps an IP address to an ISO-3166 alpha-2 country code.
pub trait CountryLookup: Send + Sync {
    fn lookup(&self, ip: &str) -> Result<Option<String>, LookupError>;
}

// ============================================================================
// MaxmindCountryLookup
// ============================================================================

pub struct MaxmindCountryLookup {
    db_path: PathBuf,
    reader: RwLock<Option<Reader<Vec<u8>>>>,
}

impl MaxmindCountryLookup {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let lookup = Self {
            db_path: db_path.into(),
            reader: RwLock::new(None),
        };
        if lookup.ensure_reader().is_ok() {
            info!("[Geo] Loaded GeoIP database {}", lookup.db_path.display());
        } else {
            warn!(
                "[Geo] GeoIP database {} unavailable, country enrichment idle until it appears",
                lookup.db_path.display()
            );
        }
        lookup
    }

    fn ensure_reader(&self) -> Result<(), LookupError> {
        {
            let guard = self.reader.read().expect("geo reader lock poisoned");
            if guard.is_some() {
                return Ok(());
            }
        }
        let reader = Reader::open_readfile(&self.db_path)
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;
        *self.reader.write().expect("geo reader lock poisoned") = Some(reader);
        Ok(())
    }
}

impl CountryLookup for MaxmindCountryLookup {
    fn lookup(&self, ip: &str) -> Result<Option<String>, LookupError> {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("[Geo] Skipping country lookup for unparsable address {}", ip);
                return Ok(None);
            }
        };

        self.ensure_reader()?;
        let guard = self.reader.read().expect("geo reader lock poisoned");
        let reader = guard
            .as_ref()
            .ok_or_else(|| LookupError::Unavailable("reader not loaded".to_string()))?;

        let country = reader
            .lookup::<geoip2::Country>(addr)
            .map_err(|e| LookupError::Lookup(e.to_string()))?;

        Ok(country
            .and_then(|c| c.country)
            .and_then(|c| c.iso_code)
            .map(|code| code.to_ascii_uppercase()))
    }
}
