//! Account directory seam. The session core only reads accounts, links
//! external identities to them and records MFA enrollment.
//!
//! [`StoreAccountDirectory`] keeps accounts in the credential store so every
//! instance sees the same directory; [`InMemoryAccountDirectory`] backs tests.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::credentials::CredentialGateway;
use super::store::StoreError;
use crate::models::records::SCHEMA_VERSION;
use crate::models::{AccountRecord, AccountRefRecord, KeySpace, Principal, Role};
use crate::utils::{hash_password, Password};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub subject: String,
    pub email: String,
    pub role: Role,
    /// Argon2 PHC string; `None` for accounts that only sign in through OAuth.
    pub password_hash: Option<String>,
    /// Base32 TOTP secret; present once MFA is enrolled.
    pub mfa_secret: Option<String>,
}

impl Account {
    pub fn principal(&self) -> Principal {
        Principal::new(self.subject.clone(), self.email.clone(), self.role)
    }

    pub fn mfa_enabled(&self) -> bool {
        self.mfa_secret.is_some()
    }
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error>;

    async fn find_by_subject(&self, subject: &str) -> Result<Option<Account>, anyhow::Error>;

    /// Resolve the account for an external identity, provisioning one on
    /// first sign-in. The provider-mapped role is authoritative.
    async fn link_external(
        &self,
        provider_subject: &str,
        email: &str,
        role: Role,
    ) -> Result<Account, anyhow::Error>;

    async fn set_mfa_secret(
        &self,
        subject: &str,
        secret: Option<String>,
    ) -> Result<(), anyhow::Error>;
}

/// Directory held in memory, keyed by subject.
#[derive(Default)]
pub struct InMemoryAccountDirectory {
    accounts: DashMap<String, Account>,
    external: DashMap<String, String>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: Account) {
        self.accounts.insert(account.subject.clone(), account);
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self
            .accounts
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .map(|a| a.value().clone()))
    }

    async fn find_by_subject(&self, subject: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.accounts.get(subject).map(|a| a.value().clone()))
    }

    async fn link_external(
        &self,
        provider_subject: &str,
        email: &str,
        role: Role,
    ) -> Result<Account, anyhow::Error> {
        let linked = self
            .external
            .get(provider_subject)
            .map(|s| s.value().clone());
        let existing = match linked {
            Some(subject) => self.find_by_subject(&subject).await?,
            None => self.find_by_email(email).await?,
        };

        let account = match existing {
            Some(mut account) => {
                account.role = role;
                account
            }
            None => Account {
                subject: Uuid::new_v4().to_string(),
                email: email.to_string(),
                role,
                password_hash: None,
                mfa_secret: None,
            },
        };

        self.external
            .insert(provider_subject.to_string(), account.subject.clone());
        self.insert(account.clone());
        Ok(account)
    }

    async fn set_mfa_secret(
        &self,
        subject: &str,
        secret: Option<String>,
    ) -> Result<(), anyhow::Error> {
        let mut account = self
            .accounts
            .get_mut(subject)
            .ok_or_else(|| anyhow::anyhow!("Unknown account {}", subject))?;
        account.mfa_secret = secret;
        Ok(())
    }
}

/// Directory persisted through the credential gateway.
///
/// `v1:account:<subject>` holds the profile. `v1:account-email:<email>` and
/// `v1:account-link:<provider subject>` point at it. The email index is
/// created with a conditional write, so concurrent first sign-ins for one
/// address settle on a single account.
#[derive(Clone)]
pub struct StoreAccountDirectory {
    gateway: CredentialGateway,
}

impl StoreAccountDirectory {
    pub fn new(gateway: CredentialGateway) -> Self {
        Self { gateway }
    }

    fn email_id(email: &str) -> String {
        email.trim().to_ascii_lowercase()
    }

    async fn load(&self, subject: &str) -> Result<Option<Account>, StoreError> {
        let record: Option<AccountRecord> =
            self.gateway.get_record(KeySpace::Account, subject).await?;
        Ok(record.map(Account::from))
    }

    async fn resolve(&self, space: KeySpace, id: &str) -> Result<Option<Account>, StoreError> {
        let reference: Option<AccountRefRecord> = self.gateway.get_record(space, id).await?;
        match reference {
            Some(reference) => self.load(&reference.subject).await,
            None => Ok(None),
        }
    }

    async fn save(&self, account: &Account) -> Result<(), StoreError> {
        let record = AccountRecord {
            v: SCHEMA_VERSION,
            subject: account.subject.clone(),
            email: account.email.clone(),
            role: account.role,
            password_hash: account.password_hash.clone(),
            mfa_secret: account.mfa_secret.clone(),
            updated_at: self.gateway.clock().now(),
        };
        self.gateway
            .put_record(KeySpace::Account, &account.subject, &record, None)
            .await
    }

    /// Create an account for `email` unless the address is already taken,
    /// in which case the existing account is returned untouched.
    pub async fn provision(
        &self,
        email: &str,
        role: Role,
        password_hash: Option<String>,
    ) -> Result<Account, StoreError> {
        let email_id = Self::email_id(email);
        if let Some(existing) = self.resolve(KeySpace::AccountEmail, &email_id).await? {
            return Ok(existing);
        }

        let account = Account {
            subject: Uuid::new_v4().to_string(),
            email: email.trim().to_string(),
            role,
            password_hash,
            mfa_secret: None,
        };
        self.save(&account).await?;

        let reference = AccountRefRecord::new(&account.subject, self.gateway.clock().now());
        if self
            .gateway
            .claim(KeySpace::AccountEmail, &email_id, &reference, None)
            .await?
        {
            tracing::info!(subject = %account.subject, role = %account.role, "Account provisioned");
            return Ok(account);
        }

        // Another instance registered the address first.
        self.gateway.delete(KeySpace::Account, &account.subject).await?;
        self.resolve(KeySpace::AccountEmail, &email_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt {
                key: KeySpace::AccountEmail.key(&email_id),
                reason: "email index points at a missing account".to_string(),
            })
    }

    /// Seed an administrator with a password login. Does nothing when the
    /// address already has an account.
    pub async fn bootstrap_admin(
        &self,
        email: &str,
        password: &Password,
    ) -> Result<Account, anyhow::Error> {
        if let Some(existing) = self.find_by_email(email).await? {
            tracing::info!(subject = %existing.subject, "Bootstrap account already present");
            return Ok(existing);
        }
        let hash = hash_password(password)?;
        Ok(self.provision(email, Role::Admin, Some(hash)).await?)
    }
}

impl From<AccountRecord> for Account {
    fn from(record: AccountRecord) -> Self {
        Account {
            subject: record.subject,
            email: record.email,
            role: record.role,
            password_hash: record.password_hash,
            mfa_secret: record.mfa_secret,
        }
    }
}

#[async_trait]
impl AccountDirectory for StoreAccountDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self
            .resolve(KeySpace::AccountEmail, &Self::email_id(email))
            .await?)
    }

    async fn find_by_subject(&self, subject: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.load(subject).await?)
    }

    async fn link_external(
        &self,
        provider_subject: &str,
        email: &str,
        role: Role,
    ) -> Result<Account, anyhow::Error> {
        let mut account = match self.resolve(KeySpace::AccountLink, provider_subject).await? {
            Some(account) => account,
            None => {
                let account = self.provision(email, role, None).await?;
                let link = AccountRefRecord::new(&account.subject, self.gateway.clock().now());
                self.gateway
                    .put_record(KeySpace::AccountLink, provider_subject, &link, None)
                    .await?;
                account
            }
        };

        if account.role != role {
            account.role = role;
            self.save(&account).await?;
        }
        Ok(account)
    }

    async fn set_mfa_secret(
        &self,
        subject: &str,
        secret: Option<String>,
    ) -> Result<(), anyhow::Error> {
        let mut account = self
            .load(subject)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Unknown account {}", subject))?;
        account.mfa_secret = secret;
        self.save(&account).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::audit::MemoryAuditSink;
    use crate::services::circuit_breaker::{BreakerConfig, CircuitBreaker};
    use crate::services::clock::ManualClock;
    use crate::services::credentials::StoreResilience;
    use crate::services::store::InMemoryStore;
    use chrono::Utc;
    use service_core::retry::RetryConfig;
    use std::sync::Arc;

    fn store_directory(store: Arc<InMemoryStore>, clock: Arc<ManualClock>) -> StoreAccountDirectory {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));
        let gateway = CredentialGateway::new(
            store,
            breaker,
            Arc::new(MemoryAuditSink::new()),
            clock,
            StoreResilience {
                call_timeout: std::time::Duration::from_millis(200),
                retry: RetryConfig::no_retry(),
            },
        );
        StoreAccountDirectory::new(gateway)
    }

    fn shared_store() -> (Arc<InMemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (Arc::new(InMemoryStore::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn stored_accounts_are_visible_to_every_instance() {
        let (store, clock) = shared_store();
        let first = store_directory(store.clone(), clock.clone());
        let second = store_directory(store.clone(), clock);

        let linked = first
            .link_external("idp|42", "Ada@Example.com", Role::Researcher)
            .await
            .unwrap();

        let by_email = second
            .find_by_email("ada@example.com")
            .await
            .unwrap()
            .expect("email index is shared");
        assert_eq!(by_email.subject, linked.subject);
        assert_eq!(by_email.role, Role::Researcher);

        let again = second
            .link_external("idp|42", "ada@example.com", Role::Industry)
            .await
            .unwrap();
        assert_eq!(again.subject, linked.subject);
        assert_eq!(
            first.find_by_subject(&linked.subject).await.unwrap().unwrap().role,
            Role::Industry
        );
    }

    #[tokio::test]
    async fn stored_directory_links_to_provisioned_email() {
        let (store, clock) = shared_store();
        let directory = store_directory(store, clock);
        let admin = directory
            .bootstrap_admin("root@example.com", &Password::new("correct horse battery"))
            .await
            .unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(admin.password_hash.is_some());

        let repeat = directory
            .bootstrap_admin("root@example.com", &Password::new("another password"))
            .await
            .unwrap();
        assert_eq!(repeat, admin);

        let linked = directory
            .link_external("idp|root", "ROOT@example.com", Role::Admin)
            .await
            .unwrap();
        assert_eq!(linked.subject, admin.subject);
        assert!(linked.password_hash.is_some());
    }

    #[tokio::test]
    async fn mfa_secret_survives_a_restart() {
        let (store, clock) = shared_store();
        let subject = store_directory(store.clone(), clock.clone())
            .provision("grace@example.com", Role::TechTransferOfficer, None)
            .await
            .unwrap()
            .subject;

        store_directory(store.clone(), clock.clone())
            .set_mfa_secret(&subject, Some("JBSWY3DPEHPK3PXP".to_string()))
            .await
            .unwrap();

        let reloaded = store_directory(store, clock)
            .find_by_email("grace@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(reloaded.mfa_enabled());
    }

    #[tokio::test]
    async fn unavailable_store_surfaces_as_store_error() {
        let (store, clock) = shared_store();
        let directory = store_directory(store.clone(), clock);
        store.set_unavailable(true);

        let err = directory.find_by_email("ada@example.com").await.unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
    }

    #[tokio::test]
    async fn unknown_subject_cannot_enroll() {
        let (store, clock) = shared_store();
        let directory = store_directory(store, clock);
        assert!(directory
            .set_mfa_secret("nobody", Some("SECRET".to_string()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn external_identity_is_provisioned_once() {
        let directory = InMemoryAccountDirectory::new();
        let first = directory
            .link_external("google|1", "ada@example.com", Role::Researcher)
            .await
            .unwrap();
        let second = directory
            .link_external("google|1", "ada@example.com", Role::Industry)
            .await
            .unwrap();

        assert_eq!(first.subject, second.subject);
        assert_eq!(second.role, Role::Industry);
    }

    #[tokio::test]
    async fn external_identity_links_to_existing_email() {
        let directory = InMemoryAccountDirectory::new();
        directory.insert(Account {
            subject: "user-1".to_string(),
            email: "Ada@Example.com".to_string(),
            role: Role::Viewer,
            password_hash: None,
            mfa_secret: Some("SECRET".to_string()),
        });

        let linked = directory
            .link_external("idp|9", "ada@example.com", Role::Researcher)
            .await
            .unwrap();
        assert_eq!(linked.subject, "user-1");
        assert!(linked.mfa_enabled());
    }
}
