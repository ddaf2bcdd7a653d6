use super::*;

#[test]
fn test_installation_id_parsing() {
    let id: InstallationId = "98765".parse().unwrap();
    assert_eq!(id.as_u64(), 98765);
    assert_eq!(id.to_string(), "98765");

    assert!("-1".parse::<InstallationId>().is_err());
    assert!("abc".parse::<GitHubAppId>().is_err());
}

#[test]
fn test_token_usable_respects_refresh_margin() {
    let now = Utc::now();
    let token = InstallationAccessToken::new(
        "ghs_abc".to_string(),
        InstallationId::new(7),
        now + Duration::seconds(90),
    );

    assert!(token.is_usable_at(now, Duration::seconds(60)));
    assert!(!token.is_usable_at(now, Duration::seconds(90)));
    assert!(!token.is_usable_at(now + Duration::seconds(31), Duration::seconds(60)));
    assert!(!token.is_expired_at(now));
    assert!(token.is_expired_at(now + Duration::seconds(90)));
}

#[test]
fn test_debug_output_redacts_tokens() {
    let now = Utc::now();
    let token = InstallationAccessToken::new(
        "ghs_super_secret".to_string(),
        InstallationId::new(7),
        now,
    );
    let jwt = JsonWebToken::new("eyJ.secret.jwt".to_string(), GitHubAppId::new(1), now, now);

    let token_debug = format!("{:?}", token);
    let jwt_debug = format!("{:?}", jwt);

    assert!(!token_debug.contains("ghs_super_secret"));
    assert!(token_debug.contains("<REDACTED>"));
    assert!(!jwt_debug.contains("eyJ.secret.jwt"));
    assert!(jwt_debug.contains("<REDACTED>"));
}

#[test]
fn test_auth_error_transience() {
    assert!(AuthError::NetworkError("reset".to_string()).is_transient());
    assert!(AuthError::GitHubApiError {
        status: 502,
        message: "bad gateway".to_string()
    }
    .is_transient());
    assert!(AuthError::GitHubApiError {
        status: 429,
        message: "slow down".to_string()
    }
    .is_transient());
    assert!(!AuthError::GitHubApiError {
        status: 422,
        message: "unprocessable".to_string()
    }
    .is_transient());
    assert!(!AuthError::InvalidCredentials.is_transient());
    assert!(!AuthError::InstallationNotFound {
        installation_id: InstallationId::new(7)
    }
    .is_transient());
}
