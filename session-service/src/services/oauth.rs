//! OAuth2 authorization-code flow with PKCE and server-side state.
//!
//! `begin_authorization` persists `{verifier, device}` under a random state
//! value for five minutes. `complete_authorization` consumes that entry
//! exactly once, checks the device, exchanges the code with the identity
//! provider and maps the provider's role claim onto a platform role.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::audit::AuditSink;
use super::circuit_breaker::{BreakerTransition, CircuitBreaker};
use super::credentials::{ttl_from, CredentialGateway};
use super::error::AuthError;
use super::rate_limit::{RateLimiter, RateTier};
use crate::config::OAuthConfig;
use crate::models::{
    AuditAction, AuditEvent, AuditOutcome, KeySpace, OAuthStateRecord, Permission, Role,
    RoleResolution, SecurityContext,
};

pub const IDENTITY_PROVIDER: &str = "identity-provider";
pub const ALLOWED_SCOPES: [&str; 3] = ["openid", "email", "profile"];

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider unreachable: {0}")]
    Transport(String),

    #[error("Provider rejected the request with status {status}")]
    Rejected { status: u16, body: String },

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),

    #[error("Provider email is not verified")]
    UnverifiedEmail,
}

/// What the identity provider asserts about the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub provider_subject: String,
    pub email: String,
    pub role_claim: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<ProviderIdentity, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
}

/// Identity provider spoken to over HTTPS: code exchange at the token
/// endpoint, then a userinfo lookup with the returned access token.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    config: OAuthConfig,
}

impl HttpIdentityProvider {
    pub fn new(config: OAuthConfig) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.exchange_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client, config })
    }

    fn claim_str(info: &serde_json::Value, field: &str) -> Option<String> {
        match info.get(field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(values) => values
                .iter()
                .find_map(|v| v.as_str().map(str::to_string)),
            _ => None,
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn exchange(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<ProviderIdentity, ProviderError> {
        let token_res = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("code_verifier", code_verifier),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !token_res.status().is_success() {
            let status = token_res.status().as_u16();
            let body = token_res.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected { status, body });
        }

        let token: TokenEndpointResponse = token_res
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let info_res = self
            .client
            .get(&self.config.userinfo_url)
            .bearer_auth(token.access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !info_res.status().is_success() {
            let status = info_res.status().as_u16();
            let body = info_res.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected { status, body });
        }

        let info: serde_json::Value = info_res
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let provider_subject = Self::claim_str(&info, "sub")
            .or_else(|| Self::claim_str(&info, "id"))
            .ok_or_else(|| ProviderError::InvalidResponse("missing subject".to_string()))?;
        let email = Self::claim_str(&info, "email")
            .ok_or_else(|| ProviderError::InvalidResponse("missing email".to_string()))?;
        let verified = info
            .get("email_verified")
            .or_else(|| info.get("verified_email"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !verified {
            return Err(ProviderError::UnverifiedEmail);
        }

        Ok(ProviderIdentity {
            provider_subject,
            email,
            role_claim: Self::claim_str(&info, &self.config.role_claim),
        })
    }
}

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = Self::challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn challenge_for(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }
}

fn random_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Keep only scopes this service may request; none left means the default set.
pub fn normalize_scopes(requested: &[String]) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for scope in requested.iter().flat_map(|s| s.split_whitespace()) {
        if ALLOWED_SCOPES.contains(&scope) && !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_string());
        }
    }
    if scopes.is_empty() {
        scopes = ALLOWED_SCOPES.iter().map(|s| s.to_string()).collect();
    }
    scopes
}

#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

/// Identity established by a completed OAuth callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub provider_subject: String,
    pub email: String,
    pub role: Role,
    pub role_resolution: RoleResolution,
    pub permissions: BTreeSet<Permission>,
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub authorize_url: String,
    pub redirect_uri: String,
    pub state_ttl: Duration,
    pub exchange_timeout: std::time::Duration,
}

impl From<&OAuthConfig> for OAuthSettings {
    fn from(config: &OAuthConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            authorize_url: config.authorize_url.clone(),
            redirect_uri: config.redirect_uri.clone(),
            state_ttl: Duration::minutes(5),
            exchange_timeout: std::time::Duration::from_secs(config.exchange_timeout_secs),
        }
    }
}

#[derive(Clone)]
pub struct OAuthFlow {
    settings: OAuthSettings,
    gateway: CredentialGateway,
    limiter: RateLimiter,
    breaker: Arc<CircuitBreaker>,
    provider: Arc<dyn IdentityProvider>,
    audit: Arc<dyn AuditSink>,
}

impl OAuthFlow {
    pub fn new(
        settings: OAuthSettings,
        gateway: CredentialGateway,
        limiter: RateLimiter,
        breaker: Arc<CircuitBreaker>,
        provider: Arc<dyn IdentityProvider>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            settings,
            gateway,
            limiter,
            breaker,
            provider,
            audit,
        }
    }

    /// Start a login at the identity provider.
    pub async fn begin_authorization(
        &self,
        requested_scopes: &[String],
        device_fingerprint: &str,
        ip: IpAddr,
    ) -> Result<AuthorizationRequest, AuthError> {
        let pkce = PkcePair::generate();
        let state = random_state();
        let now = self.gateway.clock().now();

        let record = OAuthStateRecord::new(&pkce.verifier, device_fingerprint, now);
        self.gateway
            .put_record(
                KeySpace::OAuthState,
                &state,
                &record,
                Some(ttl_from(self.settings.state_ttl)),
            )
            .await?;

        let scope = normalize_scopes(requested_scopes).join(" ");
        let url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.settings.authorize_url,
            urlencoding::encode(&self.settings.client_id),
            urlencoding::encode(&self.settings.redirect_uri),
            urlencoding::encode(&scope),
            state,
            pkce.challenge,
        );

        tracing::info!(ip = %ip, scope = %scope, "OAuth authorization started");

        Ok(AuthorizationRequest {
            url,
            state,
            expires_at: now + self.settings.state_ttl,
        })
    }

    /// Finish the callback. Exactly one audit event is written per call.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        ctx: &SecurityContext,
    ) -> Result<ResolvedIdentity, AuthError> {
        let result = self.resolve_callback(code, state, ctx).await;

        let (outcome, subject) = match &result {
            Ok(identity) => (AuditOutcome::Success, Some(identity.provider_subject.clone())),
            Err(e) => (AuditOutcome::failure(e.kind()), None),
        };
        let mut event = AuditEvent::for_request(
            AuditAction::OAuthCallback,
            outcome,
            subject,
            ctx,
            self.gateway.clock().now(),
        );
        if let Ok(identity) = &result {
            let mut details = format!("email={}", identity.email);
            if identity.role_resolution.is_default() {
                details.push_str(&format!(
                    "; role defaulted to {}: {:?}",
                    identity.role, identity.role_resolution
                ));
            }
            event = event.with_details(details);
        }
        self.audit.record(event);

        result
    }

    async fn resolve_callback(
        &self,
        code: &str,
        state: &str,
        ctx: &SecurityContext,
    ) -> Result<ResolvedIdentity, AuthError> {
        self.limiter
            .check(RateTier::OAuthCallback, &ctx.ip.to_string())
            .await?;

        if state.is_empty() {
            return Err(AuthError::InvalidState);
        }
        let record: OAuthStateRecord = self
            .gateway
            .take_record(KeySpace::OAuthState, state)
            .await?
            .ok_or(AuthError::InvalidState)?;

        let now = self.gateway.clock().now();
        if now >= record.created_at + self.settings.state_ttl {
            return Err(AuthError::InvalidState);
        }

        let same_device: bool = record
            .device_fingerprint
            .as_bytes()
            .ct_eq(ctx.device_fingerprint.as_bytes())
            .into();
        if !same_device {
            tracing::warn!("OAuth callback from a different device than the one that started it");
            return Err(AuthError::DeviceMismatch);
        }

        let identity = self.exchange(code, &record.code_verifier).await?;

        let (role, resolution) = Role::from_provider_claim(identity.role_claim.as_deref());
        if resolution.is_default() {
            tracing::warn!(
                email = %identity.email,
                resolution = ?resolution,
                role = %role,
                "Provider role claim not recognised, using least-privileged role"
            );
        }

        Ok(ResolvedIdentity {
            provider_subject: identity.provider_subject,
            email: identity.email,
            permissions: role.default_permissions(),
            role,
            role_resolution: resolution,
        })
    }

    async fn exchange(&self, code: &str, verifier: &str) -> Result<ProviderIdentity, AuthError> {
        if code.is_empty() {
            return Err(AuthError::ExchangeFailed("empty authorization code".to_string()));
        }
        if self.breaker.is_open(IDENTITY_PROVIDER) {
            return Err(AuthError::ExchangeFailed(
                "identity provider temporarily unavailable".to_string(),
            ));
        }

        let timeout = self.settings.exchange_timeout;
        let outcome = tokio::time::timeout(timeout, self.provider.exchange(code, verifier)).await;

        match outcome {
            Ok(Ok(identity)) => {
                self.breaker.record_success(IDENTITY_PROVIDER);
                Ok(identity)
            }
            Ok(Err(e)) => {
                if matches!(e, ProviderError::Transport(_)) {
                    self.provider_failed(&e.to_string());
                }
                tracing::error!(error = %e, "OAuth code exchange failed");
                Err(AuthError::ExchangeFailed(e.to_string()))
            }
            Err(_) => {
                self.provider_failed("exchange timed out");
                tracing::error!(timeout_ms = timeout.as_millis() as u64, "OAuth code exchange timed out");
                Err(AuthError::ExchangeFailed("code exchange timed out".to_string()))
            }
        }
    }

    fn provider_failed(&self, reason: &str) {
        if let Some(BreakerTransition::Opened) = self.breaker.record_failure(IDENTITY_PROVIDER) {
            self.audit.record(
                AuditEvent::system(
                    AuditAction::CircuitBreakerOpened,
                    AuditOutcome::failure(IDENTITY_PROVIDER),
                    self.gateway.clock().now(),
                )
                .with_details(format!("opened after code exchange: {}", reason)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_rfc7636_example() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            PkcePair::challenge_for(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn generated_pairs_are_fresh() {
        let a = PkcePair::generate();
        let b = PkcePair::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_eq!(a.verifier.len(), 43);
        assert_eq!(PkcePair::challenge_for(&a.verifier), a.challenge);
    }

    #[test]
    fn state_is_256_bits_of_hex() {
        let state = random_state();
        assert_eq!(state.len(), 64);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn scopes_are_filtered_and_defaulted() {
        assert_eq!(
            normalize_scopes(&["email admin:all".to_string(), "email".to_string()]),
            vec!["email".to_string()]
        );
        assert_eq!(
            normalize_scopes(&[]),
            vec![
                "openid".to_string(),
                "email".to_string(),
                "profile".to_string()
            ]
        );
    }

    #[test]
    fn role_claim_can_be_a_list() {
        let info = serde_json::json!({ "roles": ["tto", "viewer"] });
        assert_eq!(
            HttpIdentityProvider::claim_str(&info, "roles").as_deref(),
            Some("tto")
        );
    }
}
