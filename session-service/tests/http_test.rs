mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use common::*;
use serde_json::json;

fn login_body(email: &str, password: &str) -> serde_json::Value {
    json!({ "email": email, "password": password })
}

async fn login_token(harness: &TestHarness) -> String {
    let response = send(
        harness.router(),
        request(
            Method::POST,
            "/auth/login",
            Some(login_body(USER_EMAIL, USER_PASSWORD)),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_store_and_breaker() {
    let harness = TestHarness::new();
    let response = send(harness.router(), request(Method::GET, "/health", None, None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["credential_store"], "up");
    assert_eq!(body["checks"]["credential_store_breaker"], "closed");

    harness.store.set_unavailable(true);
    let response = send(harness.router(), request(Method::GET, "/health", None, None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn jwks_is_cacheable() {
    let harness = TestHarness::new();
    let response = send(
        harness.router(),
        request(Method::GET, "/.well-known/jwks.json", None, None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["cache-control"],
        "public, max-age=3600"
    );
    let body = body_json(response).await;
    assert_eq!(body["keys"][0]["kid"], "test-key");
}

#[tokio::test]
async fn login_then_read_the_session() {
    let harness = TestHarness::new();
    let token = login_token(&harness).await;

    let response = send(
        harness.router(),
        request(Method::GET, "/auth/session", None, Some(&token)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-correlation-id"], "corr-http");

    let body = body_json(response).await;
    assert_eq!(body["subject"], USER_SUBJECT);
    assert_eq!(body["role"], "researcher");
    assert!(body["permissions"]
        .as_array()
        .unwrap()
        .contains(&json!("grant:apply")));
}

#[tokio::test]
async fn every_session_failure_reads_the_same() {
    let harness = TestHarness::new();
    let token = login_token(&harness).await;

    let forged = send(
        harness.router(),
        request(Method::GET, "/auth/session", None, Some("abc.def.ghi")),
    )
    .await;
    let moved = send(
        harness.router(),
        request_from(
            Method::GET,
            "/auth/session",
            None,
            Some(&token),
            "198.51.100.4",
            DEVICE,
        ),
    )
    .await;

    for response in [forged, moved] {
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Invalid session");
    }
}

#[tokio::test]
async fn missing_device_fingerprint_is_a_bad_request() {
    let harness = TestHarness::new();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/auth/login")
        .header("x-forwarded-for", CLIENT_IP)
        .header("content-type", "application/json")
        .body(Body::from(login_body(USER_EMAIL, USER_PASSWORD).to_string()))
        .unwrap();

    let response = send(harness.router(), req).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_email_fails_validation() {
    let harness = TestHarness::new();
    let response = send(
        harness.router(),
        request(
            Method::POST,
            "/auth/login",
            Some(login_body("not-an-email", "x")),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["error"], "Validation error");
}

#[tokio::test]
async fn limited_login_sets_retry_after() {
    let harness = TestHarness::new();

    for _ in 0..5 {
        let response = send(
            harness.router(),
            request(
                Method::POST,
                "/auth/login",
                Some(login_body(USER_EMAIL, "wrong")),
                None,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = send(
        harness.router(),
        request(
            Method::POST,
            "/auth/login",
            Some(login_body(USER_EMAIL, "wrong")),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "900");
}

#[tokio::test]
async fn mfa_login_over_http() {
    let harness = TestHarness::new();
    let response = send(
        harness.router(),
        request(
            Method::POST,
            "/auth/login",
            Some(login_body(MFA_EMAIL, MFA_PASSWORD)),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["requires_mfa"], true);
    assert!(body.get("access_token").is_none());
    let ticket = body["mfa_ticket"].as_str().unwrap().to_string();

    let both = send(
        harness.router(),
        request(
            Method::POST,
            "/auth/mfa/verify",
            Some(json!({
                "mfa_ticket": ticket,
                "code": harness.totp_now(MFA_SECRET),
                "backup_code": "ABCD-EFGH-JKMN",
            })),
            None,
        ),
    )
    .await;
    assert_eq!(both.status(), StatusCode::BAD_REQUEST);

    let response = send(
        harness.router(),
        request(
            Method::POST,
            "/auth/mfa/verify",
            Some(json!({
                "mfa_ticket": ticket,
                "code": harness.totp_now(MFA_SECRET),
            })),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["token_type"], "Bearer");
    let token = body["access_token"].as_str().unwrap().to_string();

    let response = send(
        harness.router(),
        request(Method::GET, "/auth/devices", None, Some(&token)),
    )
    .await;
    assert_eq!(body_json(response).await["devices"], json!([DEVICE]));

    let uri = format!("/auth/devices/{}", DEVICE);
    let response = send(
        harness.router(),
        request(Method::DELETE, &uri, None, Some(&token)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = send(
        harness.router(),
        request(Method::DELETE, &uri, None, Some(&token)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn enrollment_reports_backup_codes() {
    let harness = TestHarness::new();
    let token = login_token(&harness).await;

    let response = send(
        harness.router(),
        request(Method::POST, "/auth/mfa/enroll", None, Some(&token)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["backup_codes"].as_array().unwrap().len(), 10);

    let response = send(
        harness.router(),
        request(Method::GET, "/auth/mfa/backup-codes", None, Some(&token)),
    )
    .await;
    assert_eq!(body_json(response).await["remaining"], 10);
}

#[tokio::test]
async fn refresh_and_logout_over_http() {
    let harness = TestHarness::new();
    let token = login_token(&harness).await;

    let response = send(
        harness.router(),
        request(
            Method::POST,
            "/auth/refresh",
            Some(json!({ "token": token })),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = body_json(response).await["access_token"]
        .as_str()
        .unwrap()
        .to_string();

    let response = send(
        harness.router(),
        request(Method::POST, "/auth/logout", None, Some(&rotated)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        harness.router(),
        request(Method::GET, "/auth/session", None, Some(&rotated)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        harness.router(),
        request(Method::POST, "/auth/logout", None, None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oauth_round_trip_over_http() {
    let harness = TestHarness::new();
    harness
        .provider
        .identity("code-9", "idp|9", "new@example.com", Some("researcher"));

    let response = send(
        harness.router(),
        request(
            Method::GET,
            "/auth/oauth/authorize?scope=openid%20email",
            None,
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let state = body["state"].as_str().unwrap().to_string();
    assert!(body["authorization_url"]
        .as_str()
        .unwrap()
        .contains("code_challenge_method=S256"));

    let uri = format!("/auth/oauth/callback?code=code-9&state={}", state);
    let stolen = send(
        harness.router(),
        request_from(Method::GET, &uri, None, None, CLIENT_IP, "other-device"),
    )
    .await;
    assert_eq!(stolen.status(), StatusCode::UNAUTHORIZED);

    // The mismatched attempt consumed the state, so start over.
    let response = send(
        harness.router(),
        request(Method::GET, "/auth/oauth/authorize", None, None),
    )
    .await;
    let state = body_json(response).await["state"]
        .as_str()
        .unwrap()
        .to_string();
    let uri = format!("/auth/oauth/callback?code=code-9&state={}", state);
    let response = send(harness.router(), request(Method::GET, &uri, None, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["access_token"].is_string());
}
