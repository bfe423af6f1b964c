mod common;

use chrono::Duration;
use common::*;
use session_service::{
    models::{AuditAction, Permission},
    services::{AuthError, LoginCredentials, LoginOutcome, SessionGrant},
    utils::Password,
};

async fn password_login(harness: &TestHarness) -> SessionGrant {
    let outcome = harness
        .state
        .auth
        .login(
            LoginCredentials::Password {
                email: USER_EMAIL.to_string(),
                password: Password::new(USER_PASSWORD),
            },
            &harness.ctx(),
        )
        .await
        .expect("login succeeds");
    match outcome {
        LoginOutcome::Authenticated(grant) => grant,
        LoginOutcome::MfaRequired(_) => panic!("account has no MFA"),
    }
}

#[tokio::test]
async fn login_without_mfa_issues_verifiable_token() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;

    assert_eq!(grant.subject, USER_SUBJECT);
    assert_eq!(grant.expires_at, start_time() + Duration::minutes(15));

    let identity = harness
        .state
        .auth
        .authenticate(&grant.token, &harness.ctx())
        .await
        .unwrap();
    assert_eq!(identity.subject, USER_SUBJECT);
    assert_eq!(identity.email, USER_EMAIL);
    assert_eq!(identity.session_id, grant.session_id);
    assert!(identity.has_permission(Permission::TechnologyCreate));

    let logins = harness.audit.events_for(AuditAction::Login);
    assert_eq!(logins.len(), 1);
    assert!(logins[0].outcome.is_success());
    assert_eq!(logins[0].subject.as_deref(), Some(USER_SUBJECT));
}

#[tokio::test]
async fn wrong_password_and_unknown_account_look_the_same() {
    let harness = TestHarness::new();

    for email in [USER_EMAIL, "nobody@example.com"] {
        let err = harness
            .state
            .auth
            .login(
                LoginCredentials::Password {
                    email: email.to_string(),
                    password: Password::new("not the password"),
                },
                &harness.ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    let failures = harness.audit.events_for(AuditAction::Login);
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .all(|e| e.outcome.kind() == Some("invalid_credentials")));
}

#[tokio::test]
async fn token_is_bound_to_device_and_address() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;
    let auth = &harness.state.auth;

    let other_device = harness.ctx_from(CLIENT_IP, "device-2");
    assert!(matches!(
        auth.authenticate(&grant.token, &other_device).await,
        Err(AuthError::ContextMismatch)
    ));

    let other_ip = harness.ctx_from("198.51.100.4", DEVICE);
    assert!(matches!(
        auth.authenticate(&grant.token, &other_ip).await,
        Err(AuthError::ContextMismatch)
    ));
}

#[tokio::test]
async fn token_expires_at_its_deadline() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;

    harness.clock.advance(Duration::minutes(15) - Duration::seconds(1));
    assert!(harness
        .state
        .auth
        .authenticate(&grant.token, &harness.ctx())
        .await
        .is_ok());

    harness.clock.advance(Duration::seconds(1));
    assert!(matches!(
        harness
            .state
            .auth
            .authenticate(&grant.token, &harness.ctx())
            .await,
        Err(AuthError::Expired)
    ));
}

#[tokio::test]
async fn revocation_is_permanent() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;
    let auth = &harness.state.auth;

    auth.logout(&grant.token, &harness.ctx()).await.unwrap();
    // Idempotent
    auth.logout(&grant.token, &harness.ctx()).await.unwrap();

    for minutes in [0, 1, 5, 14] {
        harness.clock.set(start_time() + Duration::minutes(minutes));
        assert!(matches!(
            auth.authenticate(&grant.token, &harness.ctx()).await,
            Err(AuthError::Revoked)
        ));
    }
    assert_eq!(harness.audit.events_for(AuditAction::Logout).len(), 2);
}

#[tokio::test]
async fn refresh_rotates_within_the_session() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;
    let auth = &harness.state.auth;

    harness.clock.advance(Duration::minutes(5));
    let refreshed = auth.refresh(&grant.token, &harness.ctx()).await.unwrap();

    assert_ne!(refreshed.token, grant.token);
    assert_eq!(refreshed.session_id, grant.session_id);
    assert_eq!(refreshed.expires_at, start_time() + Duration::minutes(20));

    assert!(matches!(
        auth.authenticate(&grant.token, &harness.ctx()).await,
        Err(AuthError::Revoked)
    ));
    assert!(auth.authenticate(&refreshed.token, &harness.ctx()).await.is_ok());
}

#[tokio::test]
async fn concurrent_rotation_has_exactly_one_winner() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;
    let auth = harness.state.auth.clone();
    let ctx = harness.ctx();

    let (a, b) = tokio::join!(
        auth.refresh(&grant.token, &ctx),
        auth.refresh(&grant.token, &ctx)
    );

    let results = [a, b];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(AuthError::RotationConflict)))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);
}

#[tokio::test]
async fn replayed_token_revokes_the_whole_session() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;
    let auth = &harness.state.auth;

    let rotated = auth.refresh(&grant.token, &harness.ctx()).await.unwrap();

    // An attacker replays the old token.
    let err = auth.refresh(&grant.token, &harness.ctx()).await.unwrap_err();
    assert!(matches!(err, AuthError::RotationConflict));

    // The legitimate holder's newer token is gone too.
    assert!(matches!(
        auth.authenticate(&rotated.token, &harness.ctx()).await,
        Err(AuthError::Revoked)
    ));

    let conflicts = harness.audit.events_for(AuditAction::RotationConflict);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(
        conflicts[0].details.as_deref(),
        Some(format!("session_id={}", grant.session_id).as_str())
    );
}

#[tokio::test]
async fn tampered_token_is_malformed() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;

    let mut parts: Vec<String> = grant.token.split('.').map(str::to_string).collect();
    parts[1] = parts[1].chars().rev().collect();
    let forged = parts.join(".");

    assert!(matches!(
        harness
            .state
            .auth
            .authenticate(&forged, &harness.ctx())
            .await,
        Err(AuthError::Malformed)
    ));
    assert!(matches!(
        harness
            .state
            .auth
            .authenticate("not-a-token", &harness.ctx())
            .await,
        Err(AuthError::Malformed)
    ));
}

#[tokio::test]
async fn authorize_checks_the_permission_set() {
    let harness = TestHarness::new();
    let grant = password_login(&harness).await;
    let auth = &harness.state.auth;
    let identity = auth.authenticate(&grant.token, &harness.ctx()).await.unwrap();

    assert!(auth.authorize(&identity, Permission::GrantApply).is_ok());
    assert!(matches!(
        auth.authorize(&identity, Permission::UserManage),
        Err(AuthError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn jwks_publishes_the_signing_key() {
    let harness = TestHarness::new();
    let jwks = harness.state.auth.jwt().jwks();

    assert_eq!(jwks.keys.len(), 1);
    let key = &jwks.keys[0];
    assert_eq!(key.kty, "RSA");
    assert_eq!(key.alg, "RS256");
    assert_eq!(key.key_use, "sig");
    assert_eq!(key.kid, "test-key");
    assert_eq!(key.e, "AQAB");
}
