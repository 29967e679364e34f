//! HTTP Basic authentication over the store's `users` table.
//!
//! Passwords are stored as `salt$sha256(salt:password)` hex digests. At boot
//! a default `admin` account is created if none exists.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::PoolError;
use crate::modules::store::ProxyStore;
use crate::server::AppState;

const DEFAULT_ADMIN_USER: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "password";

/// Identity of the authenticated caller, inserted as a request extension.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub username: String,
}

// ============================================================================
// Password hashing
// ============================================================================

pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::random();
    let salt_hex = hex(&salt);
    format!("{}${}", salt_hex, digest_hex(&salt_hex, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, digest)) => digest_hex(salt, password) == digest,
        None => false,
    }
}

fn digest_hex(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// Bootstrap & credential checks
// ============================================================================

/// Create the default admin account when no administrator exists yet.
pub fn ensure_admin_user(store: &ProxyStore) -> Result<(), PoolError> {
    let created =
        store.insert_user_if_absent(DEFAULT_ADMIN_USER, &hash_password(DEFAULT_ADMIN_PASSWORD))?;
    if created {
        warn!(
            "[Auth] No administrator detected, created default admin account with credentials {}:{}",
            DEFAULT_ADMIN_USER, DEFAULT_ADMIN_PASSWORD
        );
    }
    Ok(())
}

/// Validate a username/password pair against the store.
pub fn check_credentials(
    store: &ProxyStore,
    username: &str,
    password: &str,
) -> Result<AuthUser, PoolError> {
    let user = store.get_user(username)?.ok_or(PoolError::Unauthorized)?;
    if verify_password(password, &user.password_hash) {
        Ok(AuthUser {
            username: user.username,
        })
    } else {
        Err(PoolError::Unauthorized)
    }
}

// ============================================================================
// Middleware
// ============================================================================

fn extract_basic_credentials(request: &Request) -> Option<(String, String)> {
    let raw = request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = BASE64.decode(raw).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn unauthorized() -> Response {
    let body = Json(serde_json::json!({
        "status": "error",
        "error": "unauthorized",
        "message": "incorrect username or password",
    }));
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"proxyfleet\"")],
        body,
    )
        .into_response()
}

/// Require HTTP Basic credentials on every request that reaches this layer.
pub async fn basic_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some((username, password)) = extract_basic_credentials(&request) else {
        return unauthorized();
    };

    match check_credentials(&state.store, &username, &password) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(PoolError::Unauthorized) => unauthorized(),
        Err(e) => {
            warn!("[Auth] Credential check failed: {}", e);
            unauthorized()
        }
    }
}
