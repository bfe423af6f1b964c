use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::{pkcs8::DecodePublicKey, traits::PublicKeyParts, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use super::cache::TtlCache;
use super::credentials::{ttl_from, CredentialGateway};
use super::error::AuthError;
use crate::config::JwtConfig;
use crate::models::{
    KeySpace, MarkerRecord, Permission, Principal, RevocationReason, RevocationRecord, Role,
    SecurityContext, SessionIdentity, SessionRecord,
};

/// Claims carried by every session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    /// Subject (account id)
    pub sub: String,
    pub email: String,
    pub role: Role,
    pub perms: BTreeSet<Permission>,
    /// Session id, shared by every token rotated from the same login
    pub sid: String,
    /// Device fingerprint the token is bound to
    pub dfp: String,
    pub ip: String,
    pub iat: i64,
    pub exp: i64,
    /// Token id (for revocation)
    pub jti: String,
}

/// A freshly signed token and what was recorded for it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: String,
    pub session_id: String,
    pub subject: String,
    pub expires_at: DateTime<Utc>,
}

/// Public half of the signing key as a JSON Web Key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone)]
pub struct TokenPolicy {
    pub issuer: String,
    pub key_id: String,
    pub lifetime: Duration,
    pub rotation_retention: Duration,
    pub revocation_floor: Duration,
}

impl From<&JwtConfig> for TokenPolicy {
    fn from(config: &JwtConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            key_id: config.key_id.clone(),
            lifetime: Duration::minutes(config.token_lifetime_minutes),
            rotation_retention: Duration::hours(config.rotation_retention_hours),
            revocation_floor: Duration::minutes(config.revocation_floor_minutes),
        }
    }
}

/// Issues, verifies, rotates and revokes RS256 session tokens.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwks: JwkSet,
    policy: TokenPolicy,
    gateway: CredentialGateway,
    decoded: Arc<TtlCache<String, SessionClaims>>,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AuthError> {
    Utc.timestamp_opt(secs, 0).single().ok_or(AuthError::Malformed)
}

impl JwtService {
    /// Load the RSA key pair from the configured PEM files.
    pub fn new(
        config: &JwtConfig,
        gateway: CredentialGateway,
        decoded: Arc<TtlCache<String, SessionClaims>>,
    ) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;
        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;

        Self::from_pem(
            &private_key_pem,
            &public_key_pem,
            TokenPolicy::from(config),
            gateway,
            decoded,
        )
    }

    pub fn from_pem(
        private_key_pem: &str,
        public_key_pem: &str,
        policy: TokenPolicy,
        gateway: CredentialGateway,
        decoded: Arc<TtlCache<String, SessionClaims>>,
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to read public key components: {}", e))?;
        let jwks = JwkSet {
            keys: vec![Jwk {
                kty: "RSA".to_string(),
                alg: "RS256".to_string(),
                key_use: "sig".to_string(),
                kid: policy.key_id.clone(),
                n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
                e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
            }],
        };

        tracing::info!(kid = %policy.key_id, "JWT service initialized with RS256 keys");

        Ok(Self {
            encoding_key,
            decoding_key,
            jwks,
            policy,
            gateway,
            decoded,
        })
    }

    pub fn jwks(&self) -> &JwkSet {
        &self.jwks
    }

    pub fn lifetime(&self) -> Duration {
        self.policy.lifetime
    }

    /// Issue a token for a new session.
    pub async fn issue(
        &self,
        principal: &Principal,
        device_fingerprint: &str,
        ip: IpAddr,
    ) -> Result<IssuedToken, AuthError> {
        let session_id = Uuid::new_v4().to_string();
        self.issue_in_session(principal, &session_id, device_fingerprint, ip)
            .await
    }

    #[tracing::instrument(skip(self, principal, device_fingerprint), fields(subject = %principal.subject))]
    async fn issue_in_session(
        &self,
        principal: &Principal,
        session_id: &str,
        device_fingerprint: &str,
        ip: IpAddr,
    ) -> Result<IssuedToken, AuthError> {
        if principal.subject.trim().is_empty() {
            return Err(AuthError::InvalidIdentity("subject is required".to_string()));
        }
        if principal.email.trim().is_empty() {
            return Err(AuthError::InvalidIdentity("email is required".to_string()));
        }

        let now = self.gateway.clock().now();
        let expires_at = now + self.policy.lifetime;
        let claims = SessionClaims {
            iss: self.policy.issuer.clone(),
            sub: principal.subject.clone(),
            email: principal.email.clone(),
            role: principal.role,
            perms: principal.role.default_permissions(),
            sid: session_id.to_string(),
            dfp: device_fingerprint.to_string(),
            ip: ip.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.policy.key_id.clone());
        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode session token: {}", e))?;

        // The token is only released once the store has acknowledged it.
        let record = SessionRecord::new(&claims.sub, session_id, &claims.jti, expires_at);
        self.gateway
            .put_record(
                KeySpace::Session,
                session_id,
                &record,
                Some(ttl_from(self.policy.lifetime)),
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Session record write failed, withholding token");
                AuthError::from(e)
            })?;

        tracing::info!(session_id = %session_id, token_id = %claims.jti, "Session token issued");

        Ok(IssuedToken {
            token,
            token_id: claims.jti,
            session_id: session_id.to_string(),
            subject: claims.sub,
            expires_at,
        })
    }

    /// Signature and structure only; no time, revocation or context checks.
    fn decode_claims(&self, token: &str) -> Result<SessionClaims, AuthError> {
        if let Some(claims) = self.decoded.get(&token.to_string()) {
            return Ok(claims);
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_issuer(&[self.policy.issuer.as_str()]);

        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token failed to decode");
                AuthError::Malformed
            })?
            .claims;

        let now = self.gateway.clock().now();
        if let Ok(remaining) = (timestamp(claims.exp)? - now).to_std() {
            self.decoded
                .set(token.to_string(), claims.clone(), Some(remaining));
        }
        Ok(claims)
    }

    async fn is_revoked(&self, claims: &SessionClaims) -> Result<bool, AuthError> {
        self.gateway
            .any_exists(&[
                (KeySpace::Revoked, claims.jti.as_str()),
                (KeySpace::SessionRevoked, claims.sid.as_str()),
            ])
            .await
            .map_err(AuthError::from)
    }

    /// Full verification against the presenting request's context.
    pub async fn verify(
        &self,
        token: &str,
        ctx: &SecurityContext,
    ) -> Result<SessionIdentity, AuthError> {
        let claims = self.decode_claims(token)?;

        if self.is_revoked(&claims).await? {
            return Err(AuthError::Revoked);
        }

        let now = self.gateway.clock().now();
        let issued_at = timestamp(claims.iat)?;
        let expires_at = timestamp(claims.exp)?;
        if now < issued_at || now >= expires_at {
            return Err(AuthError::Expired);
        }

        let ip: IpAddr = claims.ip.parse().map_err(|_| AuthError::Malformed)?;
        if claims.dfp != ctx.device_fingerprint || ip != ctx.ip {
            tracing::warn!(
                session_id = %claims.sid,
                correlation_id = %ctx.correlation_id,
                "Token presented from a different device or address"
            );
            return Err(AuthError::ContextMismatch);
        }

        Ok(SessionIdentity {
            subject: claims.sub,
            email: claims.email,
            role: claims.role,
            permissions: claims.perms,
            session_id: claims.sid,
            token_id: claims.jti,
            device_fingerprint: claims.dfp,
            ip,
            issued_at,
            expires_at,
        })
    }

    /// Exchange a valid token for a new one in the same session. The old token
    /// id is claimed in the revocation set first; of two concurrent rotations
    /// only one wins the claim.
    pub async fn rotate(
        &self,
        old_token: &str,
        ctx: &SecurityContext,
    ) -> Result<IssuedToken, AuthError> {
        let identity = match self.verify(old_token, ctx).await {
            Ok(identity) => identity,
            Err(AuthError::Revoked) => return Err(AuthError::RotationConflict),
            Err(e) => return Err(e),
        };

        let now = self.gateway.clock().now();
        let ttl = (identity.expires_at - now).max(self.policy.rotation_retention);
        let record = RevocationRecord::new(RevocationReason::Rotated, &identity.subject, now);
        let claimed = self
            .gateway
            .claim(KeySpace::Revoked, &identity.token_id, &record, Some(ttl_from(ttl)))
            .await?;
        if !claimed {
            tracing::warn!(
                session_id = %identity.session_id,
                token_id = %identity.token_id,
                "Lost rotation race"
            );
            return Err(AuthError::RotationConflict);
        }
        self.decoded.invalidate(&old_token.to_string());

        self.issue_in_session(
            &identity.principal(),
            &identity.session_id,
            &ctx.device_fingerprint,
            ctx.ip,
        )
        .await
    }

    /// Revoke a token. Revoking an already revoked or expired token succeeds.
    pub async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.decode_claims(token)?;
        let now = self.gateway.clock().now();
        let remaining = timestamp(claims.exp)? - now;
        let ttl = remaining.max(self.policy.revocation_floor);

        let record = RevocationRecord::new(RevocationReason::Logout, &claims.sub, now);
        let created = self
            .gateway
            .claim(KeySpace::Revoked, &claims.jti, &record, Some(ttl_from(ttl)))
            .await?;
        self.decoded.invalidate(&token.to_string());

        tracing::info!(token_id = %claims.jti, already_revoked = !created, "Token revoked");
        Ok(())
    }

    /// Revoke every token of a session, past and future.
    pub async fn revoke_session(&self, session_id: &str) -> Result<(), AuthError> {
        let now = self.gateway.clock().now();
        let ttl = self.policy.lifetime.max(self.policy.rotation_retention);
        self.gateway
            .put_record(
                KeySpace::SessionRevoked,
                session_id,
                &MarkerRecord::new(now),
                Some(ttl_from(ttl)),
            )
            .await?;
        tracing::warn!(session_id = %session_id, "Session family revoked");
        Ok(())
    }

    /// Session id of a token whose signature verifies, regardless of its state.
    pub fn session_id_of(&self, token: &str) -> Result<String, AuthError> {
        self.decode_claims(token).map(|c| c.sid)
    }
}
