use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::fmt;
use std::sync::OnceLock;

/// Submitted password; never printed.
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Argon2id hash with a random salt, in PHC string form.
pub fn hash_password(password: &Password) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_str().as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

/// Check a password against a stored PHC hash. A hash that cannot be parsed
/// never matches.
pub fn verify_password(password: &Password, stored_hash: &str) -> bool {
    let parsed = match PasswordHash::new(stored_hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(error = %e, "Stored password hash is unreadable");
            return false;
        }
    };

    Argon2::default()
        .verify_password(password.as_str().as_bytes(), &parsed)
        .is_ok()
}

/// Burn the same work as a real check when no account matched, so unknown
/// emails cannot be told apart by response time.
pub fn verify_against_dummy(password: &Password) {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    let dummy = DUMMY.get_or_init(|| hash_password(&Password::new("dummy-password")).ok());
    if let Some(hash) = dummy {
        let _ = verify_password(password, hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let password = Password::new("correct horse battery staple");
        let hash = hash_password(&password).expect("hashes");

        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(&password, &hash));
        assert!(!verify_password(&Password::new("wrong"), &hash));
    }

    #[test]
    fn salts_differ() {
        let password = Password::new("same");
        let a = hash_password(&password).expect("hashes");
        let b = hash_password(&password).expect("hashes");
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_hash_never_matches() {
        assert!(!verify_password(&Password::new("x"), "not-a-phc-string"));
    }

    #[test]
    fn debug_hides_the_secret() {
        let shown = format!("{:?}", Password::new("hunter2"));
        assert!(!shown.contains("hunter2"));
    }
}
