pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::from_fn,
    routing::{delete, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::tracing::{
    request_id_middleware, CORRELATION_ID_HEADER, REQUEST_ID_HEADER,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::SessionConfig;
use crate::middleware::DEVICE_FINGERPRINT_HEADER;
use crate::services::{
    AccountDirectory, AuditSink, AuthFacade, CircuitBreaker, Clock, CredentialGateway,
    CredentialStore, IdentityProvider, JwtService, MfaGate, OAuthFlow, OAuthSettings,
    RateLimiter, SessionClaims, StoreAccountDirectory, TtlCache,
};

/// External collaborators the session core runs against.
pub struct Collaborators {
    pub store: Arc<dyn CredentialStore>,
    /// `None` keeps accounts in the credential store.
    pub directory: Option<Arc<dyn AccountDirectory>>,
    pub provider: Arc<dyn IdentityProvider>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: SessionConfig,
    pub auth: AuthFacade,
    pub gateway: CredentialGateway,
    pub token_cache: Arc<TtlCache<String, SessionClaims>>,
}

impl AppState {
    /// Wire the services together. Fails if the signing keys cannot be loaded.
    pub fn build(config: SessionConfig, deps: Collaborators) -> Result<Self, anyhow::Error> {
        let Collaborators {
            store,
            directory,
            provider,
            audit,
            clock,
        } = deps;

        let breaker = Arc::new(CircuitBreaker::new(config.store.breaker(), clock.clone()));
        let gateway = CredentialGateway::new(
            store,
            breaker.clone(),
            audit.clone(),
            clock,
            config.store.resilience(),
        );
        let limiter = RateLimiter::new(gateway.clone(), config.rate_limit.policies());
        let directory = directory.unwrap_or_else(|| {
            Arc::new(StoreAccountDirectory::new(gateway.clone())) as Arc<dyn AccountDirectory>
        });

        let token_cache = Arc::new(TtlCache::new(
            Duration::from_secs(config.cache.ttl_secs),
            config.cache.capacity,
        ));
        let jwt = JwtService::new(&config.jwt, gateway.clone(), token_cache.clone())?;

        let oauth = OAuthFlow::new(
            OAuthSettings::from(&config.oauth),
            gateway.clone(),
            limiter.clone(),
            breaker,
            provider,
            audit.clone(),
        );
        let mfa = MfaGate::new(&config.mfa, gateway.clone(), limiter.clone());

        let auth = AuthFacade::new(jwt, limiter, oauth, mfa, directory, gateway.clone(), audit);

        Ok(AppState {
            config,
            auth,
            gateway,
            token_cache,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins: Vec<HeaderValue> = state
        .config
        .security
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect();

    Router::new()
        .route("/health", get(health_check))
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
        .route("/auth/login", post(handlers::auth::session::login))
        .route("/auth/refresh", post(handlers::auth::session::refresh))
        .route("/auth/logout", post(handlers::auth::session::logout))
        .route("/auth/session", get(handlers::auth::session::current_session))
        .route("/auth/mfa/verify", post(handlers::auth::mfa::verify))
        .route("/auth/mfa/enroll", post(handlers::auth::mfa::enroll))
        .route("/auth/mfa/backup-codes", get(handlers::auth::mfa::backup_codes))
        .route("/auth/devices", get(handlers::auth::mfa::trusted_devices))
        .route(
            "/auth/devices/:fingerprint",
            delete(handlers::auth::mfa::forget_device),
        )
        .route("/auth/oauth/authorize", get(handlers::auth::oauth::authorize))
        .route("/auth/oauth/callback", get(handlers::auth::oauth::callback))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let correlation_id = request
                    .headers()
                    .get(CORRELATION_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    correlation_id = %correlation_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            }),
        )
        // Outside the trace layer so the span sees the resolved id
        .layer(from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(DEVICE_FINGERPRINT_HEADER),
                    HeaderName::from_static(CORRELATION_ID_HEADER),
                    HeaderName::from_static(REQUEST_ID_HEADER),
                ]),
        )
}

/// Service health check. Reports the credential store and its breaker.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let breaker = state.gateway.breaker_snapshot();

    state.gateway.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Credential store health check failed");
        AppError::ServiceUnavailable("Credential store unavailable".to_string())
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "credential_store": "up",
            "credential_store_breaker": if breaker.open { "open" } else { "closed" },
            "token_cache_entries": state.token_cache.len(),
        }
    })))
}
