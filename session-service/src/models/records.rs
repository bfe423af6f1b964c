//! Versioned record schemas for everything kept in the credential store.
//!
//! Keys are namespaced `v1:<namespace>:<id>` and every value is JSON carrying
//! a `v` field. A stored value whose version this build does not understand is
//! reported as corrupt instead of being trusted.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::Role;

pub const SCHEMA_VERSION: u16 = 1;

/// Key namespaces in the credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpace {
    Revoked,
    SessionRevoked,
    Session,
    OAuthState,
    MfaChallenge,
    TotpStep,
    BackupCodes,
    UsedBackupCodes,
    DeviceTrust,
    RateWindow,
    RateBlock,
    Account,
    AccountEmail,
    AccountLink,
}

impl KeySpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySpace::Revoked => "revoked",
            KeySpace::SessionRevoked => "session-revoked",
            KeySpace::Session => "session",
            KeySpace::OAuthState => "oauth-state",
            KeySpace::MfaChallenge => "mfa-challenge",
            KeySpace::TotpStep => "totp-step",
            KeySpace::BackupCodes => "mfa-backup",
            KeySpace::UsedBackupCodes => "mfa-backup-used",
            KeySpace::DeviceTrust => "device-trust",
            KeySpace::RateWindow => "rl",
            KeySpace::RateBlock => "rl-block",
            KeySpace::Account => "account",
            KeySpace::AccountEmail => "account-email",
            KeySpace::AccountLink => "account-link",
        }
    }

    pub fn key(&self, id: &str) -> String {
        format!("v{}:{}:{}", SCHEMA_VERSION, self.as_str(), id)
    }
}

/// A value that can be written to and read back from the store.
pub trait VersionedRecord: Serialize + DeserializeOwned {
    fn version(&self) -> u16;

    fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn decode(raw: &str) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_str(raw).map_err(RecordError::Malformed)?;
        if record.version() != SCHEMA_VERSION {
            return Err(RecordError::UnsupportedVersion(record.version()));
        }
        Ok(record)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(serde_json::Error),

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u16),
}

macro_rules! versioned {
    ($ty:ty) => {
        impl VersionedRecord for $ty {
            fn version(&self) -> u16 {
                self.v
            }
        }
    };
}

/// Why a token identifier was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    Rotated,
    ReuseDetected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub v: u16,
    pub reason: RevocationReason,
    pub subject: String,
    pub revoked_at: DateTime<Utc>,
}

impl RevocationRecord {
    pub fn new(reason: RevocationReason, subject: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            v: SCHEMA_VERSION,
            reason,
            subject: subject.into(),
            revoked_at: now,
        }
    }
}
versioned!(RevocationRecord);

/// Written on every issuance; its success confirms the store is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub v: u16,
    pub subject: String,
    pub session_id: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        subject: impl Into<String>,
        session_id: impl Into<String>,
        token_id: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            v: SCHEMA_VERSION,
            subject: subject.into(),
            session_id: session_id.into(),
            token_id: token_id.into(),
            expires_at,
        }
    }
}
versioned!(SessionRecord);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthStateRecord {
    pub v: u16,
    pub code_verifier: String,
    pub device_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl OAuthStateRecord {
    pub fn new(
        code_verifier: impl Into<String>,
        device_fingerprint: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            v: SCHEMA_VERSION,
            code_verifier: code_verifier.into(),
            device_fingerprint: device_fingerprint.into(),
            created_at,
        }
    }
}
versioned!(OAuthStateRecord);

/// Pending second-factor step for a login that required MFA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallengeRecord {
    pub v: u16,
    pub subject: String,
    pub device_fingerprint: String,
    pub ip: String,
    pub created_at: DateTime<Utc>,
}

impl MfaChallengeRecord {
    pub fn new(
        subject: impl Into<String>,
        device_fingerprint: impl Into<String>,
        ip: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            v: SCHEMA_VERSION,
            subject: subject.into(),
            device_fingerprint: device_fingerprint.into(),
            ip: ip.into(),
            created_at,
        }
    }
}
versioned!(MfaChallengeRecord);

/// Marker stored for short-lived claims (TOTP steps, session-family
/// revocation) where only presence matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub v: u16,
    pub created_at: DateTime<Utc>,
}

impl MarkerRecord {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            v: SCHEMA_VERSION,
            created_at,
        }
    }
}
versioned!(MarkerRecord);

/// Account profile. Kept without a TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub v: u16,
    pub subject: String,
    pub email: String,
    pub role: Role,
    pub password_hash: Option<String>,
    pub mfa_secret: Option<String>,
    pub updated_at: DateTime<Utc>,
}
versioned!(AccountRecord);

/// Index entry pointing an email or external identity at an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRefRecord {
    pub v: u16,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

impl AccountRefRecord {
    pub fn new(subject: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            v: SCHEMA_VERSION,
            subject: subject.into(),
            created_at,
        }
    }
}
versioned!(AccountRefRecord);
