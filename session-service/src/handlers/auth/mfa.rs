use service_core::{
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
        Json,
    },
    error::AppError,
};

use crate::{
    dtos::auth::{
        BackupCodesStatus, MfaEnrollResponse, MfaVerifyRequest, TokenResponse,
        TrustedDevicesResponse,
    },
    middleware::AuthSession,
    models::SecurityContext,
    services::MfaInput,
    utils::ValidatedJson,
    AppState,
};

/// Second step of an MFA login.
pub async fn verify(
    State(state): State<AppState>,
    ctx: SecurityContext,
    ValidatedJson(req): ValidatedJson<MfaVerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let input = MfaInput::from_parts(req.code.as_deref(), req.backup_code.as_deref())?;
    let grant = state.auth.complete_mfa(&req.mfa_ticket, input, &ctx).await?;
    Ok((StatusCode::OK, Json(TokenResponse::from(grant))))
}

pub async fn enroll(
    State(state): State<AppState>,
    AuthSession(identity): AuthSession,
) -> Result<impl IntoResponse, AppError> {
    let enrollment = state.auth.enroll_mfa(&identity).await?;
    Ok((StatusCode::CREATED, Json(MfaEnrollResponse::from(enrollment))))
}

pub async fn backup_codes(
    State(state): State<AppState>,
    AuthSession(identity): AuthSession,
) -> Result<impl IntoResponse, AppError> {
    let remaining = state.auth.remaining_backup_codes(&identity.subject).await?;
    Ok(Json(BackupCodesStatus { remaining }))
}

pub async fn trusted_devices(
    State(state): State<AppState>,
    AuthSession(identity): AuthSession,
) -> Result<impl IntoResponse, AppError> {
    let devices = state.auth.trusted_devices(&identity.subject).await?;
    Ok(Json(TrustedDevicesResponse { devices }))
}

pub async fn forget_device(
    State(state): State<AppState>,
    AuthSession(identity): AuthSession,
    Path(fingerprint): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if state
        .auth
        .forget_device(&identity.subject, &fingerprint)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}
