pub mod auth;
pub mod context;

pub use auth::AuthSession;
pub use context::{BearerToken, DEVICE_FINGERPRINT_HEADER};
