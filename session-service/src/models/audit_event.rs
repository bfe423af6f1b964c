//! Audit event model - security-relevant session transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::SecurityContext;

/// Audit actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    MfaVerification,
    OAuthCallback,
    TokenRefresh,
    RotationConflict,
    Logout,
    DeviceTrusted,
    CircuitBreakerOpened,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Login => "login",
            AuditAction::MfaVerification => "mfa_verification",
            AuditAction::OAuthCallback => "oauth_callback",
            AuditAction::TokenRefresh => "token_refresh",
            AuditAction::RotationConflict => "rotation_conflict",
            AuditAction::Logout => "logout",
            AuditAction::DeviceTrusted => "device_trusted",
            AuditAction::CircuitBreakerOpened => "circuit_breaker_opened",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// `kind` is the exact error kind, never a collapsed generic message.
    Failure { kind: String },
}

impl AuditOutcome {
    pub fn failure(kind: impl Into<String>) -> Self {
        AuditOutcome::Failure { kind: kind.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Success)
    }

    /// Error kind of a failure.
    pub fn kind(&self) -> Option<&str> {
        match self {
            AuditOutcome::Success => None,
            AuditOutcome::Failure { kind } => Some(kind),
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub subject: Option<String>,
    pub ip: Option<String>,
    pub device_fingerprint: Option<String>,
    pub correlation_id: Option<String>,
    pub details: Option<String>,
}

impl AuditEvent {
    /// Event for a request carrying a security context.
    pub fn for_request(
        action: AuditAction,
        outcome: AuditOutcome,
        subject: Option<String>,
        ctx: &SecurityContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp,
            action,
            outcome,
            subject,
            ip: Some(ctx.ip.to_string()),
            device_fingerprint: Some(ctx.device_fingerprint.clone()),
            correlation_id: Some(ctx.correlation_id.clone()),
            details: None,
        }
    }

    /// Event raised by the service itself, outside any request.
    pub fn system(action: AuditAction, outcome: AuditOutcome, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp,
            action,
            outcome,
            subject: None,
            ip: None,
            device_fingerprint: None,
            correlation_id: None,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
