//! Session and credential lifecycle services.
//!
//! Leaf to root: the credential store and its guarded gateway, the token
//! service, rate limiting, the OAuth flow, the MFA gate and the facade that
//! ties them together.

pub mod accounts;
pub mod audit;
pub mod auth;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod credentials;
pub mod error;
pub mod jwt;
pub mod mfa;
pub mod oauth;
pub mod rate_limit;
pub mod store;

pub use accounts::{Account, AccountDirectory, InMemoryAccountDirectory, StoreAccountDirectory};
pub use audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use auth::{AuthFacade, LoginCredentials, LoginOutcome, SessionGrant};
pub use cache::TtlCache;
pub use circuit_breaker::{BreakerConfig, CircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{CredentialGateway, StoreResilience};
pub use error::AuthError;
pub use jwt::{IssuedToken, JwkSet, JwtService, SessionClaims, TokenPolicy};
pub use mfa::{MfaChallenge, MfaEnrollment, MfaGate, MfaInput};
pub use oauth::{
    HttpIdentityProvider, IdentityProvider, OAuthFlow, OAuthSettings, ProviderError,
    ProviderIdentity,
};
pub use rate_limit::{RateDecision, RateLimitPolicies, RateLimiter, RateTier};
pub use store::{CredentialStore, InMemoryStore, RedisStore, StoreError};
