pub mod mfa;
pub mod oauth;
pub mod session;
