//! Shared harness for the session-service integration tests.
//!
//! Builds the full service stack over the in-memory credential store, the
//! fixture RSA key pair, a manual clock and a scripted identity provider.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, Response},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use session_service::{
    build_router,
    config::{
        CacheConfig, Environment, JwtConfig, MfaConfig, OAuthConfig, RateLimitConfig,
        RedisConfig, SecurityConfig, SessionConfig, StoreConfig, TierConfig,
    },
    models::{Role, SecurityContext},
    services::{
        Account, AccountDirectory, Clock, IdentityProvider, InMemoryAccountDirectory,
        InMemoryStore, ManualClock, MemoryAuditSink, ProviderError, ProviderIdentity,
    },
    utils::{hash_password, Password},
    AppState, Collaborators,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use totp_rs::{Algorithm, Secret, TOTP};
use tower::ServiceExt;

pub const USER_SUBJECT: &str = "user-ada";
pub const USER_EMAIL: &str = "ada@example.com";
pub const USER_PASSWORD: &str = "correct horse battery staple";

pub const MFA_SUBJECT: &str = "user-grace";
pub const MFA_EMAIL: &str = "grace@example.com";
pub const MFA_PASSWORD: &str = "another long passphrase";
pub const MFA_SECRET: &str = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";

pub const CLIENT_IP: &str = "203.0.113.10";
pub const DEVICE: &str = "device-1";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
}

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

fn tier(max_count: u64, window_secs: i64, cooldown_secs: i64) -> TierConfig {
    TierConfig {
        max_count,
        window_secs,
        cooldown_secs,
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        common: service_core::config::Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
        },
        environment: Environment::Dev,
        service_name: "session-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        },
        jwt: JwtConfig {
            private_key_path: fixture("jwt_private.pem"),
            public_key_path: fixture("jwt_public.pem"),
            issuer: "session-service".to_string(),
            key_id: "test-key".to_string(),
            token_lifetime_minutes: 15,
            rotation_retention_hours: 24,
            revocation_floor_minutes: 5,
        },
        oauth: OAuthConfig {
            client_id: "techtransfer-web".to_string(),
            client_secret: "client-secret".to_string(),
            authorize_url: "https://idp.example/authorize".to_string(),
            token_url: "https://idp.example/token".to_string(),
            userinfo_url: "https://idp.example/userinfo".to_string(),
            redirect_uri: "http://localhost:8080/auth/oauth/callback".to_string(),
            role_claim: "role".to_string(),
            exchange_timeout_secs: 1,
        },
        mfa: MfaConfig {
            issuer: "TechTransfer".to_string(),
            backup_code_pepper: "test-pepper-0123456789".to_string(),
            challenge_ttl_minutes: 5,
        },
        rate_limit: RateLimitConfig {
            login: tier(5, 900, 300),
            refresh: tier(10, 60, 60),
            mfa: tier(3, 300, 900),
            oauth_callback: tier(10, 300, 300),
        },
        store: StoreConfig {
            call_timeout_ms: 500,
            max_retries: 1,
            breaker_threshold: 5,
            breaker_cooldown_secs: 30,
        },
        cache: CacheConfig {
            ttl_secs: 30,
            capacity: 1000,
            sweep_interval_secs: 60,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        bootstrap: None,
    }
}

/// How the scripted provider answers a given authorization code.
#[derive(Debug, Clone)]
pub enum Script {
    Identity(ProviderIdentity),
    Reject,
    Hang,
    /// Fails at the transport layer without waiting.
    Unreachable,
}

#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicU64,
}

impl ScriptedProvider {
    pub fn script(&self, code: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(code.to_string(), script);
    }

    pub fn identity(&self, code: &str, subject: &str, email: &str, role: Option<&str>) {
        self.script(
            code,
            Script::Identity(ProviderIdentity {
                provider_subject: subject.to_string(),
                email: email.to_string(),
                role_claim: role.map(str::to_string),
            }),
        );
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn exchange(
        &self,
        code: &str,
        _code_verifier: &str,
    ) -> Result<ProviderIdentity, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().get(code).cloned();
        match script {
            Some(Script::Identity(identity)) => Ok(identity),
            Some(Script::Hang) => {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Err(ProviderError::Transport("hung".to_string()))
            }
            Some(Script::Unreachable) => {
                Err(ProviderError::Transport("connection refused".to_string()))
            }
            Some(Script::Reject) | None => Err(ProviderError::Rejected {
                status: 400,
                body: "invalid_grant".to_string(),
            }),
        }
    }
}

pub struct TestHarness {
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub directory: Arc<InMemoryAccountDirectory>,
    pub provider: Arc<ScriptedProvider>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::assemble(config, true)
    }

    /// Accounts go through the store-backed directory instead of the
    /// seeded in-memory one, which stays empty.
    pub fn with_store_directory() -> Self {
        Self::assemble(test_config(), false)
    }

    fn assemble(config: SessionConfig, in_memory_directory: bool) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let audit = Arc::new(MemoryAuditSink::new());
        let directory = Arc::new(InMemoryAccountDirectory::new());
        let provider = Arc::new(ScriptedProvider::default());

        directory.insert(Account {
            subject: USER_SUBJECT.to_string(),
            email: USER_EMAIL.to_string(),
            role: Role::Researcher,
            password_hash: Some(hash_password(&Password::new(USER_PASSWORD)).unwrap()),
            mfa_secret: None,
        });
        directory.insert(Account {
            subject: MFA_SUBJECT.to_string(),
            email: MFA_EMAIL.to_string(),
            role: Role::TechTransferOfficer,
            password_hash: Some(hash_password(&Password::new(MFA_PASSWORD)).unwrap()),
            mfa_secret: Some(MFA_SECRET.to_string()),
        });

        let state = AppState::build(
            config,
            Collaborators {
                store: store.clone(),
                directory: in_memory_directory
                    .then(|| directory.clone() as Arc<dyn AccountDirectory>),
                provider: provider.clone(),
                audit: audit.clone(),
                clock: clock.clone(),
            },
        )
        .expect("state builds from fixtures");

        Self {
            state,
            store,
            clock,
            audit,
            directory,
            provider,
        }
    }

    pub fn ctx(&self) -> SecurityContext {
        SecurityContext::new(CLIENT_IP.parse::<IpAddr>().unwrap(), DEVICE, "corr-test")
    }

    pub fn ctx_from(&self, ip: &str, device: &str) -> SecurityContext {
        SecurityContext::new(ip.parse::<IpAddr>().unwrap(), device, "corr-test")
    }

    /// The code an authenticator app would show right now.
    pub fn totp_now(&self, secret_base32: &str) -> String {
        totp_code(secret_base32, self.clock.now().timestamp() as u64)
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }
}

pub fn totp_code(secret_base32: &str, unix_secs: u64) -> String {
    let secret = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret,
        Some("TechTransfer".to_string()),
        "test".to_string(),
    )
    .unwrap()
    .generate(unix_secs)
}

/// Build an HTTP request carrying the harness client's address and device.
pub fn request(
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
    bearer: Option<&str>,
) -> Request<Body> {
    request_from(method, uri, body, bearer, CLIENT_IP, DEVICE)
}

pub fn request_from(
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
    bearer: Option<&str>,
    ip: &str,
    device: &str,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header("x-device-fingerprint", device)
        .header("x-correlation-id", "corr-http");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn send(app: Router, req: Request<Body>) -> Response<Body> {
    app.oneshot(req).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
