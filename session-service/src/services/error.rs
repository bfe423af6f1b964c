use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

use super::store::StoreError;

/// Every failure the session core can surface. Kinds are kept distinct all the
/// way to the audit log; only the HTTP conversion collapses session failures
/// into a generic message.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Malformed token")]
    Malformed,

    #[error("Token expired")]
    Expired,

    #[error("Token revoked")]
    Revoked,

    #[error("Security context mismatch")]
    ContextMismatch,

    #[error("Token already rotated")]
    RotationConflict,

    #[error("Rate limited until {reset_at}")]
    RateLimited {
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    #[error("Invalid or expired authorization state")]
    InvalidState,

    #[error("Device fingerprint mismatch")]
    DeviceMismatch,

    #[error("Code exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("Invalid MFA input: {0}")]
    InvalidMfaInput(String),

    #[error("Backup code already used")]
    BackupCodeAlreadyUsed,

    #[error("Credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Second factor rejected")]
    MfaFailed,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Account directory failures caused by the credential store fail closed
    /// the same way direct store calls do.
    pub fn from_directory(err: anyhow::Error) -> Self {
        match err.downcast::<StoreError>() {
            Ok(store) => store.into(),
            Err(other) => AuthError::Internal(other),
        }
    }

    /// Stable identifier recorded in audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidIdentity(_) => "invalid_identity",
            AuthError::Malformed => "malformed",
            AuthError::Expired => "expired",
            AuthError::Revoked => "revoked",
            AuthError::ContextMismatch => "context_mismatch",
            AuthError::RotationConflict => "rotation_conflict",
            AuthError::RateLimited { .. } => "rate_limited",
            AuthError::InvalidState => "invalid_state",
            AuthError::DeviceMismatch => "device_mismatch",
            AuthError::ExchangeFailed(_) => "exchange_failed",
            AuthError::InvalidMfaInput(_) => "invalid_mfa_input",
            AuthError::BackupCodeAlreadyUsed => "backup_code_already_used",
            AuthError::StoreUnavailable(_) => "store_unavailable",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::MfaFailed => "mfa_failed",
            AuthError::PermissionDenied(_) => "permission_denied",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Session failures presented to clients as one generic message.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            AuthError::Malformed
                | AuthError::Expired
                | AuthError::Revoked
                | AuthError::ContextMismatch
                | AuthError::RotationConflict
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::StoreUnavailable(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        if err.is_session_failure() {
            return AppError::Unauthorized(anyhow::anyhow!("Invalid session"));
        }

        match err {
            AuthError::RateLimited {
                retry_after_secs, ..
            } => AppError::TooManyRequests(
                "Too many attempts, try again later".to_string(),
                Some(retry_after_secs),
            ),
            AuthError::InvalidState
            | AuthError::DeviceMismatch
            | AuthError::InvalidCredentials
            | AuthError::MfaFailed
            | AuthError::ExchangeFailed(_)
            | AuthError::InvalidIdentity(_) => AppError::Unauthorized(anyhow::anyhow!(err.to_string())),
            AuthError::InvalidMfaInput(_) | AuthError::BackupCodeAlreadyUsed => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            AuthError::PermissionDenied(_) => AppError::Forbidden(anyhow::anyhow!(err.to_string())),
            AuthError::StoreUnavailable(_) => {
                AppError::ServiceUnavailable("Session store unavailable".to_string())
            }
            AuthError::Internal(e) => AppError::InternalError(e),
            // Session failures returned above.
            AuthError::Malformed
            | AuthError::Expired
            | AuthError::Revoked
            | AuthError::ContextMismatch
            | AuthError::RotationConflict => AppError::Unauthorized(anyhow::anyhow!("Invalid session")),
        }
    }
}
