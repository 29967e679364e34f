//! Admin API server: route assembly, middleware stack, and lifecycle.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::modules::store::ProxyStore;
use crate::pool::assignment::AssignmentEngine;
use crate::pool::registry::ProxyRegistry;
use crate::pool::settings::SettingsRegistry;

/// Shared application state for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: ProxyStore,
    pub registry: ProxyRegistry,
    pub engine: AssignmentEngine,
    pub settings: SettingsRegistry,
}

impl AppState {
    pub fn new(
        store: ProxyStore,
        registry: ProxyRegistry,
        engine: AssignmentEngine,
        settings: SettingsRegistry,
    ) -> Self {
        Self {
            store,
            registry,
            engine,
            settings,
        }
    }
}

/// Build the full application router. Everything except `/health` sits
/// behind HTTP Basic authentication.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/add_proxies", post(handlers::add_proxy))
        .route("/proxies", get(handlers::list_proxies))
        .route("/assign_proxy", post(handlers::assign_proxy))
        .route("/update_proxy/:proxy_id", post(handlers::edit_proxy))
        .route("/delete_proxy/:proxy_id", post(handlers::delete_proxy))
        .route("/refresh_proxy_usage/:proxy_id", post(handlers::refresh_proxy_usage))
        .route("/clear_instance_proxies/:instance_id", post(handlers::clear_instance_proxies))
        .route(
            "/clear_instance_from_specific_proxy/:proxy_id/:instance_id",
            post(handlers::clear_instance_from_specific_proxy),
        )
        .route("/reset_all_proxies", post(handlers::reset_all_proxies))
        .route("/settings", get(handlers::get_settings))
        .route("/update_settings", post(handlers::update_settings))
        .route("/reset_password", post(handlers::reset_password))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::basic_auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn serve(
    addr: &str,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin API listening at http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Admin API shut down");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
