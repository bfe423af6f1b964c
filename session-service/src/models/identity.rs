use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

use super::role::{Permission, Role};

/// An account identity resolved by a password check or an OAuth exchange,
/// before any session exists for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    pub email: String,
    pub role: Role,
}

impl Principal {
    pub fn new(subject: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            subject: subject.into(),
            email: email.into(),
            role,
        }
    }
}

/// Request-scoped facts supplied by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    pub ip: IpAddr,
    pub device_fingerprint: String,
    pub correlation_id: String,
}

impl SecurityContext {
    pub fn new(
        ip: IpAddr,
        device_fingerprint: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            ip,
            device_fingerprint: device_fingerprint.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

/// The identity embedded in a verified session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionIdentity {
    pub subject: String,
    pub email: String,
    pub role: Role,
    pub permissions: BTreeSet<Permission>,
    pub session_id: String,
    pub token_id: String,
    pub device_fingerprint: String,
    pub ip: IpAddr,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionIdentity {
    pub fn principal(&self) -> Principal {
        Principal::new(self.subject.clone(), self.email.clone(), self.role)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}
