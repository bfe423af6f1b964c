//! Request extractors for the security context and bearer token.

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use service_core::error::AppError;
use service_core::middleware::tracing::correlation_id_from_headers;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use crate::models::SecurityContext;

pub const DEVICE_FINGERPRINT_HEADER: &str = "x-device-fingerprint";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const MAX_FINGERPRINT_LEN: usize = 256;

/// First hop of `x-forwarded-for`; the service runs behind a proxy that sets it.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok())
}

fn device_fingerprint(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DEVICE_FINGERPRINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_FINGERPRINT_LEN)
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for SecurityContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let device_fingerprint = device_fingerprint(&parts.headers).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Missing or invalid {} header",
                DEVICE_FINGERPRINT_HEADER
            ))
        })?;

        let ip = forwarded_ip(&parts.headers)
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip())
            })
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("Unable to determine client address"))
            })?;

        let correlation_id = correlation_id_from_headers(&parts.headers)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(SecurityContext::new(ip, device_fingerprint, correlation_id))
    }
}

/// Raw token from `Authorization: Bearer ...`.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| BearerToken(token.to_string()))
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
            })
    }
}
