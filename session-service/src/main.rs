use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use session_service::{
    build_router,
    config::SessionConfig,
    services::{
        HttpIdentityProvider, RedisStore, StoreAccountDirectory, SystemClock, TracingAuditSink,
    },
    utils::Password,
    AppState, Collaborators,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = SessionConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(AppError::ConfigError)?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting session service"
    );

    let store = RedisStore::new(&config.redis.url).await?;
    tracing::info!("Credential store connected");

    let provider = HttpIdentityProvider::new(config.oauth.clone())?;

    // Accounts live in the credential store next to the session records.
    let deps = Collaborators {
        store: Arc::new(store),
        directory: None,
        provider: Arc::new(provider),
        audit: Arc::new(TracingAuditSink),
        clock: Arc::new(SystemClock),
    };

    let state = AppState::build(config.clone(), deps)?;
    tracing::info!("Session services initialized");

    if let Some(bootstrap) = &config.bootstrap {
        StoreAccountDirectory::new(state.gateway.clone())
            .bootstrap_admin(&bootstrap.email, &Password::new(bootstrap.password.clone()))
            .await
            .map_err(AppError::InternalError)?;
    }

    let sweeper = state
        .token_cache
        .spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));

    let app = build_router(state);

    let addr = config.common.socket_addr()?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
