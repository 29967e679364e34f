// Domain error taxonomy shared by the registry, assignment engine, and the
// admin API surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("proxy {0} not found")]
    NotFound(String),

    #[error("a proxy with the same IP, port, and protocol already exists")]
    Duplicate,

    #[error("instance {instance_id} is already assigned to the maximum allowed number of proxies ({limit})")]
    InstanceSaturated { instance_id: String, limit: usize },

    #[error("{0}")]
    NoProxyAvailable(String),

    #[error("field '{0}' is not editable")]
    FieldForbidden(String),

    #[error("{0}")]
    InvalidField(String),

    #[error("no updates provided")]
    SettingsEmpty,

    #[error("instance {instance_id} not found in any proxy")]
    NotHeld { instance_id: String },

    #[error("incorrect username or password")]
    Unauthorized,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PoolError {
    /// Short machine-readable tag surfaced alongside the human message.
    pub fn tag(&self) -> &'static str {
        match self {
            PoolError::NotFound(_) => "not_found",
            PoolError::Duplicate => "duplicate",
            PoolError::InstanceSaturated { .. } => "instance_saturated",
            PoolError::NoProxyAvailable(_) => "no_proxy_available",
            PoolError::FieldForbidden(_) => "field_forbidden",
            PoolError::InvalidField(_) => "invalid_field",
            PoolError::SettingsEmpty => "settings_empty",
            PoolError::NotHeld { .. } => "not_held",
            PoolError::Unauthorized => "unauthorized",
            PoolError::Store(_) => "store_unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("uniqueness conflict")]
    Conflict,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// CountryLookup failure modes. A missing database is retryable: the
/// enrichment loop treats it as "no result this cycle".
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("GeoIP database unavailable: {0}")]
    Unavailable(String),

    #[error("GeoIP lookup failed: {0}")]
    Lookup(String),
}
