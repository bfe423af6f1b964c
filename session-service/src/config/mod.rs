use serde::Deserialize;
use service_core::config::{self as core_config, get_env, parse_env};
use service_core::error::AppError;
use std::env;

use crate::services::circuit_breaker::BreakerConfig;
use crate::services::credentials::StoreResilience;
use crate::services::rate_limit::{RateLimitPolicies, TierPolicy};
use service_core::retry::RetryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub oauth: OAuthConfig,
    pub mfa: MfaConfig,
    pub rate_limit: RateLimitConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub security: SecurityConfig,
    pub bootstrap: Option<BootstrapConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub issuer: String,
    pub key_id: String,
    pub token_lifetime_minutes: i64,
    /// How long a rotated token id stays revoked beyond its own expiry.
    pub rotation_retention_hours: i64,
    /// Minimum revocation TTL on logout.
    pub revocation_floor_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub redirect_uri: String,
    /// Userinfo field carrying the provider's role name.
    pub role_claim: String,
    pub exchange_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    pub issuer: String,
    /// Key for the backup-code HMAC digests.
    pub backup_code_pepper: String,
    pub challenge_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub max_count: u64,
    pub window_secs: i64,
    pub cooldown_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login: TierConfig,
    pub refresh: TierConfig,
    pub mfa: TierConfig,
    pub oauth_callback: TierConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub call_timeout_ms: u64,
    pub max_retries: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

/// Administrator seeded into an empty account directory on startup.
#[derive(Clone, Deserialize)]
pub struct BootstrapConfig {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

impl TierConfig {
    fn from_env(prefix: &str, defaults: (u64, i64, i64), is_prod: bool) -> Result<Self, AppError> {
        let (max, window, cooldown) = defaults;
        Ok(TierConfig {
            max_count: parse_env(
                &format!("RATE_LIMIT_{}_MAX", prefix),
                Some(&max.to_string()),
                is_prod,
            )?,
            window_secs: parse_env(
                &format!("RATE_LIMIT_{}_WINDOW_SECONDS", prefix),
                Some(&window.to_string()),
                is_prod,
            )?,
            cooldown_secs: parse_env(
                &format!("RATE_LIMIT_{}_COOLDOWN_SECONDS", prefix),
                Some(&cooldown.to_string()),
                is_prod,
            )?,
        })
    }

    pub fn policy(&self) -> TierPolicy {
        TierPolicy::new(
            self.max_count,
            chrono::Duration::seconds(self.window_secs),
            chrono::Duration::seconds(self.cooldown_secs),
        )
    }
}

impl RateLimitConfig {
    pub fn policies(&self) -> RateLimitPolicies {
        RateLimitPolicies {
            login: self.login.policy(),
            refresh: self.refresh.policy(),
            mfa: self.mfa.policy(),
            oauth_callback: self.oauth_callback.policy(),
        }
    }
}

impl StoreConfig {
    pub fn resilience(&self) -> StoreResilience {
        StoreResilience {
            call_timeout: std::time::Duration::from_millis(self.call_timeout_ms),
            retry: RetryConfig {
                max_retries: self.max_retries,
                ..RetryConfig::quick()
            },
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_threshold,
            cooldown: chrono::Duration::seconds(self.breaker_cooldown_secs),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = SessionConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("session-service"), is_prod)?,
            service_version: get_env(
                "SERVICE_VERSION",
                Some(env!("CARGO_PKG_VERSION")),
                is_prod,
            )?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            jwt: JwtConfig {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
                issuer: get_env("JWT_ISSUER", Some("session-service"), is_prod)?,
                key_id: get_env("JWT_KEY_ID", Some("session-key-1"), is_prod)?,
                token_lifetime_minutes: parse_env(
                    "JWT_TOKEN_LIFETIME_MINUTES",
                    Some("15"),
                    is_prod,
                )?,
                rotation_retention_hours: parse_env(
                    "JWT_ROTATION_RETENTION_HOURS",
                    Some("24"),
                    is_prod,
                )?,
                revocation_floor_minutes: parse_env(
                    "JWT_REVOCATION_FLOOR_MINUTES",
                    Some("5"),
                    is_prod,
                )?,
            },
            oauth: OAuthConfig {
                client_id: get_env("OAUTH_CLIENT_ID", None, is_prod)?,
                client_secret: get_env("OAUTH_CLIENT_SECRET", None, is_prod)?,
                authorize_url: get_env("OAUTH_AUTHORIZE_URL", None, is_prod)?,
                token_url: get_env("OAUTH_TOKEN_URL", None, is_prod)?,
                userinfo_url: get_env("OAUTH_USERINFO_URL", None, is_prod)?,
                redirect_uri: get_env("OAUTH_REDIRECT_URI", None, is_prod)?,
                role_claim: get_env("OAUTH_ROLE_CLAIM", Some("role"), is_prod)?,
                exchange_timeout_secs: parse_env(
                    "OAUTH_EXCHANGE_TIMEOUT_SECONDS",
                    Some("10"),
                    is_prod,
                )?,
            },
            mfa: MfaConfig {
                issuer: get_env("MFA_ISSUER", Some("TechTransfer"), is_prod)?,
                backup_code_pepper: get_env("MFA_BACKUP_CODE_PEPPER", None, is_prod)?,
                challenge_ttl_minutes: parse_env("MFA_CHALLENGE_TTL_MINUTES", Some("5"), is_prod)?,
            },
            rate_limit: RateLimitConfig {
                login: TierConfig::from_env("LOGIN", (5, 900, 300), is_prod)?,
                refresh: TierConfig::from_env("REFRESH", (10, 60, 60), is_prod)?,
                mfa: TierConfig::from_env("MFA", (3, 300, 900), is_prod)?,
                oauth_callback: TierConfig::from_env("OAUTH_CALLBACK", (10, 300, 300), is_prod)?,
            },
            store: StoreConfig {
                call_timeout_ms: parse_env("STORE_CALL_TIMEOUT_MS", Some("500"), is_prod)?,
                max_retries: parse_env("STORE_MAX_RETRIES", Some("2"), is_prod)?,
                breaker_threshold: parse_env("STORE_BREAKER_THRESHOLD", Some("5"), is_prod)?,
                breaker_cooldown_secs: parse_env(
                    "STORE_BREAKER_COOLDOWN_SECONDS",
                    Some("30"),
                    is_prod,
                )?,
            },
            cache: CacheConfig {
                ttl_secs: parse_env("TOKEN_CACHE_TTL_SECONDS", Some("30"), is_prod)?,
                capacity: parse_env("TOKEN_CACHE_CAPACITY", Some("10000"), is_prod)?,
                sweep_interval_secs: parse_env(
                    "TOKEN_CACHE_SWEEP_INTERVAL_SECONDS",
                    Some("60"),
                    is_prod,
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            },
            bootstrap: match (
                env::var("BOOTSTRAP_ADMIN_EMAIL").ok().filter(|v| !v.is_empty()),
                env::var("BOOTSTRAP_ADMIN_PASSWORD").ok().filter(|v| !v.is_empty()),
            ) {
                (Some(email), Some(password)) => Some(BootstrapConfig { email, password }),
                (None, None) => None,
                _ => {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "BOOTSTRAP_ADMIN_EMAIL and BOOTSTRAP_ADMIN_PASSWORD must be set together"
                    )))
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.token_lifetime_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_TOKEN_LIFETIME_MINUTES must be positive"
            )));
        }

        if self.jwt.rotation_retention_hours < 0 || self.jwt.revocation_floor_minutes < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Revocation retention settings must not be negative"
            )));
        }

        for (name, tier) in [
            ("LOGIN", &self.rate_limit.login),
            ("REFRESH", &self.rate_limit.refresh),
            ("MFA", &self.rate_limit.mfa),
            ("OAUTH_CALLBACK", &self.rate_limit.oauth_callback),
        ] {
            if tier.max_count == 0 || tier.window_secs <= 0 || tier.cooldown_secs < 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "RATE_LIMIT_{} needs a positive max and window",
                    name
                )));
            }
        }

        if self.store.breaker_threshold == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STORE_BREAKER_THRESHOLD must be greater than 0"
            )));
        }

        if let Some(bootstrap) = &self.bootstrap {
            if bootstrap.password.len() < 12 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "BOOTSTRAP_ADMIN_PASSWORD must be at least 12 characters"
                )));
            }
        }

        if self.mfa.backup_code_pepper.len() < 16 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_BACKUP_CODE_PEPPER must be at least 16 bytes"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if !self.oauth.redirect_uri.starts_with("https://") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "OAUTH_REDIRECT_URI must use https in production"
                )));
            }
        }

        Ok(())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
