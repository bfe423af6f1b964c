//! Second-factor gate: TOTP codes and single-use backup codes.
//!
//! Backup codes are stored only as keyed HMAC-SHA256 digests in a per-subject
//! set. Redeeming one moves its digest from the available set to the used set
//! in a single atomic step, so a code can succeed at most once even under
//! concurrent submissions.

use chrono::{DateTime, Duration};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use super::credentials::{ttl_from, CredentialGateway};
use super::error::AuthError;
use super::rate_limit::{RateLimiter, RateTier};
use crate::config::MfaConfig;
use crate::models::{KeySpace, MarkerRecord, MfaChallengeRecord, SecurityContext};

pub const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP_SIZE: usize = 4;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP_SECS: u64 = 30;

type HmacSha256 = Hmac<Sha256>;

/// The second factor presented by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MfaInput {
    Totp(String),
    BackupCode(String),
}

impl MfaInput {
    /// Exactly one of the two inputs must be present and non-blank.
    pub fn from_parts(code: Option<&str>, backup_code: Option<&str>) -> Result<Self, AuthError> {
        let code = code.map(str::trim).filter(|c| !c.is_empty());
        let backup_code = backup_code.map(str::trim).filter(|c| !c.is_empty());
        match (code, backup_code) {
            (Some(code), None) => Ok(MfaInput::Totp(code.to_string())),
            (None, Some(backup)) => Ok(MfaInput::BackupCode(backup.to_string())),
            (Some(_), Some(_)) => Err(AuthError::InvalidMfaInput(
                "provide either a code or a backup code, not both".to_string(),
            )),
            (None, None) => Err(AuthError::InvalidMfaInput(
                "a code or a backup code is required".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MfaEnrollment {
    pub secret_base32: String,
    pub otpauth_url: String,
    /// Shown once; only digests are kept.
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MfaChallenge {
    pub ticket: String,
    pub expires_at: DateTime<chrono::Utc>,
}

/// Strip separators and case; `None` if the result is not a well-formed code.
pub fn normalize_backup_code(input: &str) -> Option<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let well_formed = normalized.len() == BACKUP_CODE_LEN
        && normalized
            .bytes()
            .all(|b| BACKUP_CODE_ALPHABET.contains(&b));
    well_formed.then_some(normalized)
}

fn generate_backup_code<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    rng.fill_bytes(&mut raw);
    let chars: Vec<char> = raw
        .iter()
        .map(|b| BACKUP_CODE_ALPHABET[usize::from(*b) % BACKUP_CODE_ALPHABET.len()] as char)
        .collect();
    chars
        .chunks(BACKUP_CODE_GROUP_SIZE)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Clone)]
pub struct MfaGate {
    gateway: CredentialGateway,
    limiter: RateLimiter,
    issuer: String,
    pepper: Vec<u8>,
    challenge_ttl: Duration,
}

impl MfaGate {
    pub fn new(config: &MfaConfig, gateway: CredentialGateway, limiter: RateLimiter) -> Self {
        Self {
            gateway,
            limiter,
            issuer: config.issuer.clone(),
            pepper: config.backup_code_pepper.as_bytes().to_vec(),
            challenge_ttl: Duration::minutes(config.challenge_ttl_minutes),
        }
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> Result<TOTP, AuthError> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP_SECS,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| AuthError::Internal(anyhow::anyhow!("TOTP init error: {}", e)))
    }

    fn digest(&self, normalized: &str) -> Result<String, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.pepper)
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("HMAC init error: {}", e)))?;
        mac.update(normalized.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// New TOTP secret plus a fresh batch of backup codes. Any previous
    /// backup codes stop working.
    #[tracing::instrument(skip(self, email))]
    pub async fn enroll(&self, subject: &str, email: &str) -> Result<MfaEnrollment, AuthError> {
        let secret = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Secret gen error: {}", e)))?;
        let totp = self.totp(secret, email)?;

        let backup_codes = self.replace_backup_codes(subject).await?;

        Ok(MfaEnrollment {
            secret_base32: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
            backup_codes,
        })
    }

    pub async fn replace_backup_codes(&self, subject: &str) -> Result<Vec<String>, AuthError> {
        let codes: Vec<String> = {
            let mut rng = rand::thread_rng();
            (0..BACKUP_CODE_COUNT)
                .map(|_| generate_backup_code(&mut rng))
                .collect()
        };
        let digests = codes
            .iter()
            .map(|code| {
                let normalized = normalize_backup_code(code).ok_or_else(|| {
                    AuthError::Internal(anyhow::anyhow!("generated an invalid backup code"))
                })?;
                self.digest(&normalized)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.gateway.delete(KeySpace::BackupCodes, subject).await?;
        self.gateway
            .delete(KeySpace::UsedBackupCodes, subject)
            .await?;
        self.gateway
            .set_add(KeySpace::BackupCodes, subject, &digests)
            .await?;

        tracing::info!(count = codes.len(), "Backup codes issued");
        Ok(codes)
    }

    pub async fn remaining_backup_codes(&self, subject: &str) -> Result<u64, AuthError> {
        Ok(self.gateway.set_len(KeySpace::BackupCodes, subject).await?)
    }

    /// Record a pending second-factor step bound to the caller's device and IP.
    pub async fn open_challenge(
        &self,
        subject: &str,
        ctx: &SecurityContext,
    ) -> Result<MfaChallenge, AuthError> {
        let ticket = Uuid::new_v4().to_string();
        let now = self.gateway.clock().now();
        let record = MfaChallengeRecord::new(
            subject,
            &ctx.device_fingerprint,
            ctx.ip.to_string(),
            now,
        );
        self.gateway
            .put_record(
                KeySpace::MfaChallenge,
                &ticket,
                &record,
                Some(ttl_from(self.challenge_ttl)),
            )
            .await?;

        Ok(MfaChallenge {
            ticket,
            expires_at: now + self.challenge_ttl,
        })
    }

    /// Look up a pending challenge and check it is presented from where it
    /// was opened. The challenge stays pending until [`Self::close_challenge`].
    pub async fn load_challenge(
        &self,
        ticket: &str,
        ctx: &SecurityContext,
    ) -> Result<MfaChallengeRecord, AuthError> {
        let record: MfaChallengeRecord = self
            .gateway
            .get_record(KeySpace::MfaChallenge, ticket)
            .await?
            .ok_or(AuthError::InvalidState)?;

        let now = self.gateway.clock().now();
        if now >= record.created_at + self.challenge_ttl {
            return Err(AuthError::InvalidState);
        }
        if record.device_fingerprint != ctx.device_fingerprint {
            return Err(AuthError::DeviceMismatch);
        }
        if record.ip != ctx.ip.to_string() {
            return Err(AuthError::ContextMismatch);
        }
        Ok(record)
    }

    /// Consume a pending challenge; only one caller can close it.
    pub async fn close_challenge(&self, ticket: &str) -> Result<(), AuthError> {
        let taken: Option<MfaChallengeRecord> = self
            .gateway
            .take_record(KeySpace::MfaChallenge, ticket)
            .await?;
        taken.map(|_| ()).ok_or(AuthError::InvalidState)
    }

    /// Check a second factor for `subject`. Returns `Ok(false)` for a wrong,
    /// replayed or unknown code.
    #[tracing::instrument(skip(self, totp_secret, input))]
    pub async fn verify(
        &self,
        subject: &str,
        totp_secret: Option<&str>,
        input: &MfaInput,
    ) -> Result<bool, AuthError> {
        self.limiter.check(RateTier::Mfa, subject).await?;

        match input {
            MfaInput::Totp(code) => {
                let Some(secret) = totp_secret else {
                    return Err(AuthError::InvalidMfaInput(
                        "no authenticator is enrolled for this account".to_string(),
                    ));
                };
                self.verify_totp(subject, secret, code).await
            }
            MfaInput::BackupCode(code) => self.redeem_backup_code(subject, code).await,
        }
    }

    async fn verify_totp(&self, subject: &str, secret: &str, code: &str) -> Result<bool, AuthError> {
        if code.len() != TOTP_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }

        let secret = Secret::Encoded(secret.to_string())
            .to_bytes()
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Stored TOTP secret unreadable: {}", e)))?;
        let totp = self.totp(secret, subject)?;

        let now = self.gateway.clock().now().timestamp().max(0) as u64;
        let current_step = now / TOTP_STEP_SECS;
        let skew = u64::from(TOTP_SKEW);

        let matched_step = (current_step.saturating_sub(skew)..=current_step + skew).find(|step| {
            let expected = totp.generate(step * TOTP_STEP_SECS);
            bool::from(expected.as_bytes().ct_eq(code.as_bytes()))
        });
        let Some(step) = matched_step else {
            return Ok(false);
        };

        // Each time step can be used once per subject.
        let claim_ttl = Duration::seconds((TOTP_STEP_SECS * (2 * skew + 1)) as i64);
        let fresh = self
            .gateway
            .claim(
                KeySpace::TotpStep,
                &format!("{}:{}", subject, step),
                &MarkerRecord::new(self.gateway.clock().now()),
                Some(ttl_from(claim_ttl)),
            )
            .await?;
        if !fresh {
            tracing::warn!("TOTP code replayed within its time step");
        }
        Ok(fresh)
    }

    async fn redeem_backup_code(&self, subject: &str, code: &str) -> Result<bool, AuthError> {
        let Some(normalized) = normalize_backup_code(code) else {
            return Ok(false);
        };
        let digest = self.digest(&normalized)?;

        let moved = self
            .gateway
            .set_move(
                KeySpace::BackupCodes,
                KeySpace::UsedBackupCodes,
                subject,
                &digest,
            )
            .await?;
        if moved {
            tracing::info!("Backup code redeemed");
            return Ok(true);
        }

        if self
            .gateway
            .set_contains(KeySpace::UsedBackupCodes, subject, &digest)
            .await?
        {
            return Err(AuthError::BackupCodeAlreadyUsed);
        }
        Ok(false)
    }
}
