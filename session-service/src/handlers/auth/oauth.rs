use service_core::{
    axum::{
        extract::{Query, State},
        http::StatusCode,
        response::IntoResponse,
        Json,
    },
    error::AppError,
};

use crate::{
    dtos::auth::{AuthorizeQuery, AuthorizeResponse, LoginResponse, OAuthCallbackQuery},
    models::SecurityContext,
    services::{LoginCredentials, LoginOutcome},
    AppState,
};

/// Start an OAuth login. The client follows `authorization_url` and must
/// return from the same device.
pub async fn authorize(
    State(state): State<AppState>,
    ctx: SecurityContext,
    Query(query): Query<AuthorizeQuery>,
) -> Result<impl IntoResponse, AppError> {
    let scopes: Vec<String> = query
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let request = state
        .auth
        .oauth()
        .begin_authorization(&scopes, &ctx.device_fingerprint, ctx.ip)
        .await?;

    Ok((
        StatusCode::OK,
        Json(AuthorizeResponse {
            authorization_url: request.url,
            state: request.state,
            expires_at: request.expires_at,
        }),
    ))
}

pub async fn callback(
    State(state): State<AppState>,
    ctx: SecurityContext,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<impl IntoResponse, AppError> {
    let credentials = LoginCredentials::OAuth {
        code: query.code,
        state: query.state,
    };
    let response = match state.auth.login(credentials, &ctx).await? {
        LoginOutcome::Authenticated(grant) => LoginResponse::Token(grant.into()),
        LoginOutcome::MfaRequired(challenge) => LoginResponse::MfaRequired(challenge.into()),
    };
    Ok((StatusCode::OK, Json(response)))
}
