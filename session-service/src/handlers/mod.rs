//! HTTP handlers for the authentication endpoints.

pub mod auth;
pub mod well_known;
