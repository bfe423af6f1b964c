use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use service_core::error::AppError;

use super::context::BearerToken;
use crate::{
    models::{SecurityContext, SessionIdentity},
    AppState,
};

/// A verified session: valid bearer token presented from the device and
/// address it was issued to.
#[derive(Debug, Clone)]
pub struct AuthSession(pub SessionIdentity);

#[async_trait]
impl FromRequestParts<AppState> for AuthSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let BearerToken(token) = BearerToken::from_request_parts(parts, state).await?;
        let ctx = SecurityContext::from_request_parts(parts, state).await?;

        let identity = state.auth.authenticate(&token, &ctx).await?;
        tracing::debug!(subject = %identity.subject, session_id = %identity.session_id, "Session authenticated");
        Ok(AuthSession(identity))
    }
}
