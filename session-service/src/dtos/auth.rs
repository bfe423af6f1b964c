use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::Validate;

use crate::models::{Permission, Role, SessionIdentity};
use crate::services::{MfaChallenge, MfaEnrollment, SessionGrant};

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    #[validate(length(min = 1, max = 1024, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub session_id: String,
}

impl From<SessionGrant> for TokenResponse {
    fn from(grant: SessionGrant) -> Self {
        Self {
            access_token: grant.token,
            token_type: "Bearer".to_string(),
            expires_at: grant.expires_at,
            session_id: grant.session_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MfaRequiredResponse {
    pub requires_mfa: bool,
    pub mfa_ticket: String,
    pub expires_at: DateTime<Utc>,
}

impl From<MfaChallenge> for MfaRequiredResponse {
    fn from(challenge: MfaChallenge) -> Self {
        Self {
            requires_mfa: true,
            mfa_ticket: challenge.ticket,
            expires_at: challenge.expires_at,
        }
    }
}

/// Either a token or a pending second factor.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LoginResponse {
    Token(TokenResponse),
    MfaRequired(MfaRequiredResponse),
}

#[derive(Debug, Deserialize, Validate)]
pub struct MfaVerifyRequest {
    #[validate(length(min = 1, max = 64, message = "Ticket is required"))]
    pub mfa_ticket: String,

    #[validate(length(max = 16))]
    pub code: Option<String>,

    #[validate(length(max = 32))]
    pub backup_code: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    /// Space separated.
    pub scope: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    pub authorization_url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub subject: String,
    pub email: String,
    pub role: Role,
    pub permissions: BTreeSet<Permission>,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

impl From<SessionIdentity> for SessionResponse {
    fn from(identity: SessionIdentity) -> Self {
        Self {
            subject: identity.subject,
            email: identity.email,
            role: identity.role,
            permissions: identity.permissions,
            session_id: identity.session_id,
            expires_at: identity.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MfaEnrollResponse {
    pub secret: String,
    pub otpauth_url: String,
    pub backup_codes: Vec<String>,
}

impl From<MfaEnrollment> for MfaEnrollResponse {
    fn from(enrollment: MfaEnrollment) -> Self {
        Self {
            secret: enrollment.secret_base32,
            otpauth_url: enrollment.otpauth_url,
            backup_codes: enrollment.backup_codes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupCodesStatus {
    pub remaining: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrustedDevicesResponse {
    pub devices: Vec<String>,
}
