use super::*;
use crate::circuit_breaker::CircuitState;
use crate::config::{CircuitBreakerConfig, RateLimitScope, TokenConfig};
use crate::credentials::{CredentialStore, Vault};
use crate::provider::{FakeProviderClient, TokenGrant, TransportError, MAX_RETRY_HINT};
use chrono::{Duration as ChronoDuration, Utc};

const ORG: &str = "org-1";

struct Fixture {
    gateway: ProviderGateway,
    fake: Arc<FakeProviderClient>,
    tokens: TokenManager,
    store: Arc<CredentialStore>,
}

fn fixture_with(call: CallConfig) -> Fixture {
    let store = Arc::new(CredentialStore::new(":memory:").unwrap());
    let vault = Vault::from_key_bytes(&[3u8; 32]).unwrap();
    let fake = Arc::new(FakeProviderClient::new());
    let tokens = TokenManager::new(store.clone(), vault, fake.clone(), TokenConfig::default());
    let limiter = Arc::new(RateLimiter::new(RateLimitScope::Organization));
    let breaker = Arc::new(CircuitBreaker::new(&CircuitBreakerConfig::default()));
    let gateway = ProviderGateway::new(
        tokens.clone(),
        limiter,
        breaker,
        fake.clone(),
        call,
        &RateLimitConfig::default(),
    );

    for provider in Provider::ALL {
        tokens
            .store(
                ORG,
                provider,
                &TokenGrant {
                    access_token: format!("initial-{}", provider),
                    refresh_token: Some("refresh-initial".to_string()),
                    expires_in: Some(3600),
                    scopes: vec![],
                    ad_account_id: None,
                    business_id: None,
                },
            )
            .unwrap();
    }

    Fixture {
        gateway,
        fake,
        tokens,
        store,
    }
}

fn fixture() -> Fixture {
    fixture_with(CallConfig::default())
}

fn single_attempt() -> CallConfig {
    CallConfig {
        max_attempts: 1,
        ..Default::default()
    }
}

fn meta_auth_error() -> RawResponse {
    RawResponse::new(
        401,
        r#"{"error":{"message":"Error validating access token: Session has expired","type":"OAuthException","code":190,"error_subcode":463}}"#,
    )
}

#[tokio::test(start_paused = true)]
async fn test_successful_call_returns_typed_response() {
    let f = fixture();
    let response = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap();

    let ApiResponse::AdAccounts(accounts) = response else {
        panic!("expected ad accounts");
    };
    assert_eq!(accounts[0].id, "act_1234567890");
    assert_eq!(f.fake.executed_tokens(), vec!["initial-meta"]);
}

#[tokio::test(start_paused = true)]
async fn test_google_insights_through_gateway() {
    let f = fixture();
    let request = ApiRequest::GetInsights {
        account_id: "1234567890".to_string(),
        since: "2024-03-01".to_string(),
        until: "2024-03-07".to_string(),
    };
    let ApiResponse::Insights(rows) = f.gateway.call(ORG, Provider::GoogleAds, &request).await.unwrap()
    else {
        panic!("expected insights");
    };
    assert!((rows[0].spend - 12.5).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_with_retry_after() {
    let f = fixture();
    f.fake
        .push_response(RawResponse::new(429, "").with_header("Retry-After", "30"));

    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::RateLimited {
            retry_after: Duration::from_secs(30)
        }
    );

    // 429 is neutral for the breaker
    let key = f.gateway.breaker().key(ORG, Provider::Meta);
    let snapshot = f.gateway.breaker().snapshot(&key);
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);

    // The key stays blocked without another outbound call
    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited { .. }));
    assert_eq!(f.fake.execute_calls(), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_oversized_retry_hints_are_clamped() {
    let f = fixture();
    f.fake.push_response(
        RawResponse::new(429, "{}").with_header("Retry-After", "18446744073709551615"),
    );
    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::RateLimited { retry_after: MAX_RETRY_HINT });

    let usage = format!(
        r#"{{"99":[{{"type":"ads_insights","call_count":100,"estimated_time_to_regain_access":{}}}]}}"#,
        u64::MAX
    );
    f.fake.push_response(
        RawResponse::new(429, "{}").with_header("X-Business-Use-Case-Usage", &usage),
    );
    let err = f
        .gateway
        .call(ORG, Provider::GoogleAds, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::RateLimited { retry_after: MAX_RETRY_HINT });

    tokio::time::advance(MAX_RETRY_HINT).await;
    assert!(f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_without_retry_after_uses_default() {
    let f = fixture();
    f.fake.push_response(RawResponse::new(429, "{}"));

    let err = f
        .gateway
        .call(ORG, Provider::GoogleAds, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::RateLimited {
            retry_after: Duration::from_secs(60)
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_five_failures_open_circuit() {
    let f = fixture_with(single_attempt());
    for _ in 0..5 {
        f.fake.push_response(RawResponse::new(503, "Service Unavailable"));
    }

    for _ in 0..5 {
        let err = f
            .gateway
            .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::ProviderUnavailable {
                provider: Provider::Meta,
                attempts: 1
            }
        );
    }

    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::CircuitOpen {
            provider: Provider::Meta
        }
    );
    assert_eq!(f.fake.execute_calls(), 5);

    // Other providers are unaffected
    assert!(f
        .gateway
        .call(ORG, Provider::GoogleAds, &ApiRequest::ListAdAccounts)
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let f = fixture();
    f.fake.push_response(RawResponse::new(502, "Bad Gateway"));
    f.fake.push_transport_error(TransportError::Timeout);

    let response = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap();
    assert!(matches!(response, ApiResponse::AdAccounts(_)));
    assert_eq!(f.fake.execute_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let f = fixture();
    for _ in 0..3 {
        f.fake.push_response(RawResponse::new(500, ""));
    }

    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::ProviderUnavailable {
            provider: Provider::Meta,
            attempts: 3
        }
    );
    assert_eq!(f.fake.execute_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_refreshes_once_and_retries() {
    let f = fixture();
    f.fake.push_response(meta_auth_error());

    let response = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap();
    assert!(matches!(response, ApiResponse::AdAccounts(_)));
    assert_eq!(f.fake.refresh_calls(), 1);
    assert_eq!(
        f.fake.executed_tokens(),
        vec!["initial-meta", "fake-access-1"]
    );

    // Auth failures do not count against the breaker
    let key = f.gateway.breaker().key(ORG, Provider::Meta);
    assert_eq!(f.gateway.breaker().snapshot(&key).consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_auth_rejection_requires_reconnect() {
    let f = fixture();
    f.fake.push_response(meta_auth_error());
    f.fake.push_response(meta_auth_error());

    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::AuthenticationRequired {
            provider: Provider::Meta,
            ..
        }
    ));
    assert_eq!(f.fake.refresh_calls(), 1);
    assert_eq!(f.fake.execute_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_google_unauthenticated_triggers_refresh() {
    let f = fixture();
    f.fake.push_response(RawResponse::new(
        401,
        r#"{"error":{"code":401,"message":"Request had invalid authentication credentials.","status":"UNAUTHENTICATED"}}"#,
    ));

    assert!(f
        .gateway
        .call(ORG, Provider::GoogleAds, &ApiRequest::ListAdAccounts)
        .await
        .is_ok());
    assert_eq!(f.fake.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_plain_401_is_rejected_without_refresh() {
    let f = fixture();
    f.fake.push_response(RawResponse::new(401, r#"{"error":{"message":"nope"}}"#));

    let err = f
        .gateway
        .call(ORG, Provider::GoogleAds, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ProviderRejected { status: 401, .. }));
    assert_eq!(f.fake.refresh_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_detail_is_sanitized() {
    let f = fixture();
    f.fake.push_response(RawResponse::new(
        400,
        r#"{"error":{"message":"Invalid parameter for access_token=EAAleakedtoken123","type":"GraphMethodException","code":100}}"#,
    ));

    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    let GatewayError::ProviderRejected { status, detail } = err else {
        panic!("expected ProviderRejected, got {:?}", err);
    };
    assert_eq!(status, 400);
    assert!(detail.contains("Invalid parameter"));
    assert!(!detail.contains("EAAleakedtoken123"));
    assert_eq!(f.fake.execute_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_success_body_is_invalid_response() {
    let f = fixture();
    f.fake.push_response(RawResponse::new(200, "<html>oops</html>"));

    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidResponse(_)));
}

#[tokio::test(start_paused = true)]
async fn test_not_connected_makes_no_outbound_call() {
    let f = fixture();
    f.tokens.revoke(ORG, Provider::Meta).unwrap();

    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AuthenticationRequired { .. }));
    assert_eq!(f.fake.execute_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_makes_no_outbound_call() {
    let f = fixture();
    let request = ApiRequest::ListCampaigns {
        account_id: "act_1/../../me".to_string(),
    };

    let err = f.gateway.call(ORG, Provider::Meta, &request).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert_eq!(f.fake.execute_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_refresh_hits_deadline() {
    let f = fixture();
    f.store
        .set_expires_at(ORG, Provider::Meta, Utc::now() - ChronoDuration::minutes(5))
        .unwrap();
    f.fake.set_refresh_delay(Duration::from_secs(12));

    let start = Instant::now();
    let err = f
        .gateway
        .call(ORG, Provider::Meta, &ApiRequest::ListAdAccounts)
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::DeadlineExceeded);
    let elapsed = Instant::now() - start;
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    assert_eq!(f.fake.execute_calls(), 0);
}

#[test]
fn test_auth_rejection_detection() {
    assert!(is_auth_rejection(&meta_auth_error()));
    assert!(is_auth_rejection(&RawResponse::new(
        400,
        r#"{"error":{"type":"OAuthException","code":190}}"#
    )));
    assert!(is_auth_rejection(
        &RawResponse::new(401, "").with_header("WWW-Authenticate", r#"Bearer error="invalid_token""#)
    ));
    assert!(is_auth_rejection(&RawResponse::new(401, r#"{"error":"invalid_token"}"#)));

    // Meta rate limiting is also an OAuthException, but not an auth failure
    assert!(!is_auth_rejection(&RawResponse::new(
        400,
        r#"{"error":{"type":"OAuthException","code":4}}"#
    )));
    assert!(!is_auth_rejection(&RawResponse::new(500, r#"{"error":{"code":190}}"#)));
    assert!(!is_auth_rejection(&RawResponse::new(401, "not json")));
}

#[tokio::test]
async fn test_backoff_stays_within_cap() {
    let f = fixture();
    for failures in 1..10 {
        let delay = f.gateway.backoff_delay(failures);
        let ceiling = (200u64 << (failures - 1)).min(2_000);
        assert!(delay <= Duration::from_millis(ceiling));
    }
    assert!(f.gateway.backoff_delay(0) <= Duration::from_millis(200));
    assert!(f.gateway.backoff_delay(u32::MAX) <= Duration::from_millis(2_000));
}
