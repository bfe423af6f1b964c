use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::auth::{LoginRequest, LoginResponse, RefreshRequest, SessionResponse, TokenResponse},
    middleware::{AuthSession, BearerToken},
    models::SecurityContext,
    services::{LoginCredentials, LoginOutcome},
    utils::{Password, ValidatedJson},
    AppState,
};

/// Login with email and password. Accounts with MFA get a ticket instead of a
/// token.
pub async fn login(
    State(state): State<AppState>,
    ctx: SecurityContext,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let credentials = LoginCredentials::Password {
        email: req.email,
        password: Password::new(req.password),
    };
    let response = match state.auth.login(credentials, &ctx).await? {
        LoginOutcome::Authenticated(grant) => LoginResponse::Token(grant.into()),
        LoginOutcome::MfaRequired(challenge) => LoginResponse::MfaRequired(challenge.into()),
    };
    Ok((StatusCode::OK, Json(response)))
}

/// Exchange a token for a fresh one in the same session.
pub async fn refresh(
    State(state): State<AppState>,
    ctx: SecurityContext,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let grant = state.auth.refresh(&req.token, &ctx).await?;
    Ok((StatusCode::OK, Json(TokenResponse::from(grant))))
}

pub async fn logout(
    State(state): State<AppState>,
    ctx: SecurityContext,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, AppError> {
    state.auth.logout(&token, &ctx).await?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "message": "Logged out successfully"
        })),
    ))
}

/// The verified identity behind the presented token.
pub async fn current_session(AuthSession(identity): AuthSession) -> impl IntoResponse {
    Json(SessionResponse::from(identity))
}
