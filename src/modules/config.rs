//! Process configuration from the environment.

use std::env;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8042;
const DEFAULT_GEOIP_DB: &str = "GeoLite2-Country.mmdb";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub geoip_db_path: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let host = env::var("PROXYFLEET_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PROXYFLEET_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let db_path = env::var("PROXYFLEET_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_db_path());
        let geoip_db_path = env::var("PROXYFLEET_GEOIP_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_GEOIP_DB));

        Self {
            host,
            port,
            db_path,
            geoip_db_path,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("proxyfleet")
        .join("proxyfleet.db")
}
