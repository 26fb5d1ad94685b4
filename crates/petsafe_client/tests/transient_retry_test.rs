//! Opt-in transient retries on the platform transport.


use chrono::{Duration, Utc};
use petsafe_client::{PetSafeClient, PetSafeConfig, PetSafeError, ResumeTokens};
use reqwest::StatusCode;
use serde_json::json;
use test_utils::*;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(config: &PetSafeConfig) -> PetSafeClient {
    let tokens = ResumeTokens::new("id-live", "access", "refresh")
        .unwrap()
        .with_expires_at(Utc::now() + Duration::hours(1));
    PetSafeClient::resume(EMAIL, tokens, config).unwrap()
}

/// Test that requests are retried on transient failures when enabled
#[tokio::test]
async fn server_errors_are_retried_when_enabled() {
    let api = MockServer::start().await;
    let identity = MockServer::start().await;
    let counter = RequestCounter::new();
    let attempts = counter.clone();

    // Mock that fails twice then succeeds
    Mock::given(method("GET"))
        .and(path("/smart-feed/feeders"))
        .respond_with(move |_req: &wiremock::Request| {
            if attempts.increment() < 2 {
                ResponseTemplate::new(503).set_body_string("Service Unavailable")
            } else {
                ResponseTemplate::new(200).set_body_json(json!([]))
            }
        })
        .expect(3)
        .mount(&api)
        .await;

    let config = PetSafeConfig {
        transient_retries: 3,
        ..test_config(&api, &identity)
    };
    let feeders = client(&config).get_feeders().await.unwrap();
    assert!(feeders.is_empty());
    assert_eq!(counter.get(), 3);
}

/// Test that server errors surface immediately by default
#[tokio::test]
async fn server_errors_surface_immediately_by_default() {
    let api = MockServer::start().await;
    let identity = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .expect(1)
        .mount(&api)
        .await;

    let err = client(&test_config(&api, &identity))
        .get("smart-feed/feeders")
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
}

/// Test that auth rejections are not treated as transient
#[tokio::test]
async fn auth_rejections_are_not_retried_by_the_transport() {
    let api = MockServer::start().await;
    let identity = MockServer::start().await;
    mount_refresh(&identity, "refresh", MockResponseBuilder::tokens("id-new", 3600, None), 1).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .expect(2)
        .mount(&api)
        .await;

    let config = PetSafeConfig {
        transient_retries: 3,
        ..test_config(&api, &identity)
    };
    let err = client(&config).get("smart-feed/feeders").await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
}

/// Test that identity calls are sent once even with transient retries enabled
#[tokio::test]
async fn identity_calls_are_never_replayed() {
    let api = MockServer::start().await;
    let identity = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-amz-target", TARGET_INITIATE_AUTH))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .expect(1)
        .mount(&identity)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&api)
        .await;

    let config = PetSafeConfig {
        transient_retries: 3,
        ..test_config(&api, &identity)
    };
    let tokens = ResumeTokens::new("id-stale", "access", "refresh").unwrap();
    let client = PetSafeClient::resume(EMAIL, tokens, &config).unwrap();

    let err = client.get("smart-feed/feeders").await.unwrap_err();
    assert!(matches!(err, PetSafeError::RefreshFailed(_)), "unexpected error: {err}");
    assert_eq!(client.id_token().as_deref(), Some("id-stale"));
}

#[test]
fn client_builds_with_retries() {
    let config = PetSafeConfig {
        transient_retries: 5,
        ..PetSafeConfig::default()
    };
    let client = PetSafeClient::new(EMAIL, &config).unwrap();
    let status = tokio_test::block_on(async { client.get("smart-feed/feeders").await });
    assert!(matches!(status, Err(petsafe_client::PetSafeError::NotAuthenticated)));
}
