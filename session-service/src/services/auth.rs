//! Authentication facade: the single login / refresh / logout contract the
//! HTTP layer talks to. Every security-relevant transition is audited with its
//! precise failure kind before any collapsing happens at the HTTP edge.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::accounts::{Account, AccountDirectory};
use super::audit::AuditSink;
use super::credentials::CredentialGateway;
use super::error::AuthError;
use super::jwt::{IssuedToken, JwtService};
use super::mfa::{MfaChallenge, MfaEnrollment, MfaGate, MfaInput};
use super::oauth::OAuthFlow;
use super::rate_limit::{RateLimiter, RateTier};
use crate::models::{
    AuditAction, AuditEvent, AuditOutcome, KeySpace, Permission, Principal, SecurityContext,
    SessionIdentity,
};
use crate::utils::{verify_against_dummy, verify_password, Password};

pub enum LoginCredentials {
    Password { email: String, password: Password },
    OAuth { code: String, state: String },
}

impl LoginCredentials {
    fn method(&self) -> &'static str {
        match self {
            LoginCredentials::Password { .. } => "password",
            LoginCredentials::OAuth { .. } => "oauth",
        }
    }
}

/// A released session token.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub token: String,
    pub session_id: String,
    pub subject: String,
    pub expires_at: DateTime<Utc>,
}

impl From<IssuedToken> for SessionGrant {
    fn from(issued: IssuedToken) -> Self {
        Self {
            token: issued.token,
            session_id: issued.session_id,
            subject: issued.subject,
            expires_at: issued.expires_at,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated(SessionGrant),
    /// No token yet; the second factor must be presented with this ticket.
    MfaRequired(MfaChallenge),
}

#[derive(Clone)]
pub struct AuthFacade {
    jwt: JwtService,
    limiter: RateLimiter,
    oauth: OAuthFlow,
    mfa: MfaGate,
    directory: Arc<dyn AccountDirectory>,
    gateway: CredentialGateway,
    audit: Arc<dyn AuditSink>,
}

impl AuthFacade {
    pub fn new(
        jwt: JwtService,
        limiter: RateLimiter,
        oauth: OAuthFlow,
        mfa: MfaGate,
        directory: Arc<dyn AccountDirectory>,
        gateway: CredentialGateway,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            jwt,
            limiter,
            oauth,
            mfa,
            directory,
            gateway,
            audit,
        }
    }

    pub fn oauth(&self) -> &OAuthFlow {
        &self.oauth
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    fn audit_request(
        &self,
        action: AuditAction,
        result: Result<(), &AuthError>,
        subject: Option<String>,
        ctx: &SecurityContext,
        details: Option<String>,
    ) {
        let outcome = match result {
            Ok(()) => AuditOutcome::Success,
            Err(e) => AuditOutcome::failure(e.kind()),
        };
        let mut event =
            AuditEvent::for_request(action, outcome, subject, ctx, self.gateway.clock().now());
        if let Some(details) = details {
            event = event.with_details(details);
        }
        self.audit.record(event);
    }

    /// Resolve the credentials, then either release a token or open an MFA
    /// challenge.
    #[tracing::instrument(skip_all, fields(method = credentials.method(), correlation_id = %ctx.correlation_id))]
    pub async fn login(
        &self,
        credentials: LoginCredentials,
        ctx: &SecurityContext,
    ) -> Result<LoginOutcome, AuthError> {
        let method = credentials.method();
        let (account, result) = match self.resolve_account(credentials, ctx).await {
            Ok(account) => {
                let result = self.finish_login(&account, ctx).await;
                (Some(account), result)
            }
            Err(e) => (None, Err(e)),
        };

        let details = match &result {
            Ok(LoginOutcome::MfaRequired(_)) => format!("method={} mfa=pending", method),
            _ => format!("method={}", method),
        };
        self.audit_request(
            AuditAction::Login,
            result.as_ref().map(|_| ()),
            account.map(|a| a.subject),
            ctx,
            Some(details),
        );

        if let Err(e) = &result {
            tracing::warn!(kind = e.kind(), "Login failed");
        }
        result
    }

    async fn resolve_account(
        &self,
        credentials: LoginCredentials,
        ctx: &SecurityContext,
    ) -> Result<Account, AuthError> {
        match credentials {
            LoginCredentials::Password { email, password } => {
                let email = email.trim().to_lowercase();
                self.limiter.check(RateTier::Login, &email).await?;

                let account = self
                    .directory
                    .find_by_email(&email)
                    .await
                    .map_err(AuthError::from_directory)?;

                let Some(account) = account else {
                    verify_against_dummy(&password);
                    return Err(AuthError::InvalidCredentials);
                };
                let Some(hash) = account.password_hash.as_deref() else {
                    verify_against_dummy(&password);
                    return Err(AuthError::InvalidCredentials);
                };
                if !verify_password(&password, hash) {
                    return Err(AuthError::InvalidCredentials);
                }
                Ok(account)
            }
            LoginCredentials::OAuth { code, state } => {
                let resolved = self.oauth.complete_authorization(&code, &state, ctx).await?;
                self.directory
                    .link_external(&resolved.provider_subject, &resolved.email, resolved.role)
                    .await
                    .map_err(AuthError::from_directory)
            }
        }
    }

    async fn finish_login(
        &self,
        account: &Account,
        ctx: &SecurityContext,
    ) -> Result<LoginOutcome, AuthError> {
        if account.mfa_enabled() {
            let known_device = self
                .gateway
                .set_contains(KeySpace::DeviceTrust, &account.subject, &ctx.device_fingerprint)
                .await
                .unwrap_or(false);
            let challenge = self.mfa.open_challenge(&account.subject, ctx).await?;
            tracing::info!(subject = %account.subject, known_device, "Second factor required");
            return Ok(LoginOutcome::MfaRequired(challenge));
        }

        let issued = self
            .jwt
            .issue(&account.principal(), &ctx.device_fingerprint, ctx.ip)
            .await?;
        tracing::info!(subject = %account.subject, session_id = %issued.session_id, "Session started");
        Ok(LoginOutcome::Authenticated(issued.into()))
    }

    /// Second step of an MFA login. The challenge survives a wrong code so the
    /// user can retry until the MFA tier blocks them.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub async fn complete_mfa(
        &self,
        ticket: &str,
        input: MfaInput,
        ctx: &SecurityContext,
    ) -> Result<SessionGrant, AuthError> {
        let mut subject = None;
        let result = async {
            let challenge = self.mfa.load_challenge(ticket, ctx).await?;
            subject = Some(challenge.subject.clone());

            let account = self
                .directory
                .find_by_subject(&challenge.subject)
                .await
                .map_err(AuthError::from_directory)?
                .ok_or(AuthError::InvalidState)?;

            let verified = self
                .mfa
                .verify(&account.subject, account.mfa_secret.as_deref(), &input)
                .await?;
            if !verified {
                return Err(AuthError::MfaFailed);
            }
            self.mfa.close_challenge(ticket).await?;
            Ok::<_, AuthError>(account)
        }
        .await;

        let method = match &input {
            MfaInput::Totp(_) => "totp",
            MfaInput::BackupCode(_) => "backup-code",
        };
        self.audit_request(
            AuditAction::MfaVerification,
            result.as_ref().map(|_| ()),
            subject,
            ctx,
            Some(format!("method={}", method)),
        );
        let account = result?;

        let issued = self
            .jwt
            .issue(&account.principal(), &ctx.device_fingerprint, ctx.ip)
            .await?;
        self.trust_device(&account.principal(), ctx).await;

        Ok(issued.into())
    }

    async fn trust_device(&self, principal: &Principal, ctx: &SecurityContext) {
        let added = self
            .gateway
            .set_add(
                KeySpace::DeviceTrust,
                &principal.subject,
                &[ctx.device_fingerprint.clone()],
            )
            .await;
        match added {
            Ok(0) => {}
            Ok(_) => self.audit_request(
                AuditAction::DeviceTrusted,
                Ok(()),
                Some(principal.subject.clone()),
                ctx,
                None,
            ),
            // Trust is only a signal; the session is already issued.
            Err(e) => tracing::warn!(error = %e, "Failed to record trusted device"),
        }
    }

    /// Rotate a token. A conflict means the old token was presented twice, so
    /// the whole session is revoked.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub async fn refresh(
        &self,
        old_token: &str,
        ctx: &SecurityContext,
    ) -> Result<SessionGrant, AuthError> {
        let result = async {
            self.limiter
                .check(RateTier::Refresh, &ctx.ip.to_string())
                .await?;
            self.jwt.rotate(old_token, ctx).await
        }
        .await;

        match result {
            Ok(issued) => {
                self.audit_request(
                    AuditAction::TokenRefresh,
                    Ok(()),
                    Some(issued.subject.clone()),
                    ctx,
                    None,
                );
                Ok(issued.into())
            }
            Err(AuthError::RotationConflict) => {
                let session_id = self.jwt.session_id_of(old_token).ok();
                if let Some(session_id) = &session_id {
                    if let Err(e) = self.jwt.revoke_session(session_id).await {
                        tracing::error!(error = %e, session_id = %session_id, "Failed to revoke session after token reuse");
                    }
                }
                self.audit_request(
                    AuditAction::RotationConflict,
                    Err(&AuthError::RotationConflict),
                    None,
                    ctx,
                    session_id.map(|sid| format!("session_id={}", sid)),
                );
                Err(AuthError::RotationConflict)
            }
            Err(e) => {
                self.audit_request(AuditAction::TokenRefresh, Err(&e), None, ctx, None);
                Err(e)
            }
        }
    }

    pub async fn logout(&self, token: &str, ctx: &SecurityContext) -> Result<(), AuthError> {
        let result = self.jwt.revoke(token).await;
        self.audit_request(AuditAction::Logout, result.as_ref().copied(), None, ctx, None);
        result
    }

    /// Verify a bearer token for a protected route.
    pub async fn authenticate(
        &self,
        token: &str,
        ctx: &SecurityContext,
    ) -> Result<SessionIdentity, AuthError> {
        self.jwt.verify(token, ctx).await
    }

    pub fn authorize(
        &self,
        identity: &SessionIdentity,
        permission: Permission,
    ) -> Result<(), AuthError> {
        if identity.has_permission(permission) {
            Ok(())
        } else {
            tracing::warn!(
                subject = %identity.subject,
                permission = ?permission,
                "Permission denied"
            );
            Err(AuthError::PermissionDenied(format!("{:?}", permission)))
        }
    }

    /// Enroll (or re-enroll) the authenticated user in MFA.
    pub async fn enroll_mfa(&self, identity: &SessionIdentity) -> Result<MfaEnrollment, AuthError> {
        let enrollment = self.mfa.enroll(&identity.subject, &identity.email).await?;
        self.directory
            .set_mfa_secret(&identity.subject, Some(enrollment.secret_base32.clone()))
            .await
            .map_err(AuthError::from_directory)?;
        tracing::info!(subject = %identity.subject, "MFA enrolled");
        Ok(enrollment)
    }

    pub async fn remaining_backup_codes(&self, subject: &str) -> Result<u64, AuthError> {
        self.mfa.remaining_backup_codes(subject).await
    }

    pub async fn trusted_devices(&self, subject: &str) -> Result<Vec<String>, AuthError> {
        let mut devices = self
            .gateway
            .set_members(KeySpace::DeviceTrust, subject)
            .await?;
        devices.sort();
        Ok(devices)
    }

    pub async fn forget_device(&self, subject: &str, fingerprint: &str) -> Result<bool, AuthError> {
        Ok(self
            .gateway
            .set_remove(KeySpace::DeviceTrust, subject, fingerprint)
            .await?)
    }
}
