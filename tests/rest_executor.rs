//! REST executor against a mock HTTP server
//!
//! Real time: retry and rate-limit delays are kept in the tens of
//! milliseconds so waits are observable without slowing the suite.

use arrakis_client::config::{RestSettings, Token};
use arrakis_client::error::RestError;
use arrakis_client::rest::route::{GET_CHANNEL, POST_CHANNEL_MESSAGES};
use arrakis_client::rest::{fetch_gateway_bot, RequestPayload, RestExecutor};
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(base_url: String) -> RestSettings {
    RestSettings {
        base_url,
        request_timeout: Duration::from_secs(5),
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(50),
        max_rate_limit: Duration::from_secs(2),
        ..RestSettings::default()
    }
}

fn executor(server: &MockServer) -> RestExecutor {
    RestExecutor::new(settings(server.uri()), Some(Token::new("test-token"))).unwrap()
}

fn bucket_headers(template: ResponseTemplate, bucket: &str, remaining: u32, reset_after: &str) -> ResponseTemplate {
    template
        .insert_header("x-ratelimit-bucket", bucket)
        .insert_header("x-ratelimit-limit", "5")
        .insert_header("x-ratelimit-remaining", remaining.to_string().as_str())
        .insert_header("x-ratelimit-reset-after", reset_after)
}

#[tokio::test]
async fn success_learns_the_bucket() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/channels/123"))
        .and(header("authorization", "Bot test-token"))
        .and(header("x-audit-log-reason", "spring%20cleaning"))
        .respond_with(bucket_headers(
            ResponseTemplate::new(200).set_body_json(json!({"id": "123", "name": "general"})),
            "abc",
            4,
            "1.0",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = GET_CHANNEL.compile(&[("channel_id", "123")]).unwrap();
    let response = rest
        .execute(&route, &RequestPayload::default().reason("spring cleaning"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    let channel: serde_json::Value = response.json().unwrap();
    assert_eq!(channel["name"], "general");

    let bucket = rest.bucket(&route).unwrap();
    assert_eq!(bucket.key, "abc;123");
    assert_eq!(bucket.limit, 5);
    assert_eq!(bucket.remaining, 4);
    assert!(!bucket.provisional);
    assert_eq!(bucket.in_flight, 0);
}

#[tokio::test]
async fn json_body_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/channels/9/messages"))
        .and(body_json(json!({"content": "hello"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
        .expect(1)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = POST_CHANNEL_MESSAGES.compile(&[("channel_id", "9")]).unwrap();
    rest.execute(&route, &RequestPayload::json(json!({"content": "hello"})))
        .await
        .unwrap();
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string(r#"{"message":"Unknown Channel"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = GET_CHANNEL.compile(&[("channel_id", "404")]).unwrap();
    let err = rest.execute(&route, &RequestPayload::default()).await.unwrap_err();

    match err {
        RestError::ClientError { status, body, .. } => {
            assert_eq!(status, 404);
            assert!(body.contains("Unknown Channel"));
        }
        other => panic!("expected client error, got {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = GET_CHANNEL.compile(&[("channel_id", "1")]).unwrap();
    let err = rest.execute(&route, &RequestPayload::default()).await.unwrap_err();

    assert!(matches!(err, RestError::ServerError { status: 502, attempts: 3, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn server_error_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
        .expect(1)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = GET_CHANNEL.compile(&[("channel_id", "1")]).unwrap();
    let response = rest.execute(&route, &RequestPayload::default()).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn route_rate_limit_is_waited_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(bucket_headers(
            ResponseTemplate::new(429)
                .insert_header("x-ratelimit-scope", "user")
                .set_body_json(json!({"message": "You are being rate limited.", "retry_after": 0.15, "global": false})),
            "lim",
            0,
            "0.15",
        ))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(bucket_headers(ResponseTemplate::new(200), "lim", 4, "1.0"))
        .expect(1)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = GET_CHANNEL.compile(&[("channel_id", "7")]).unwrap();
    let started = Instant::now();
    rest.execute(&route, &RequestPayload::default()).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(140));
    assert!(!rest.global().is_throttled());
    assert_eq!(rest.bucket(&route).unwrap().key, "lim;7");
}

#[tokio::test]
async fn global_rate_limit_blocks_every_route() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-ratelimit-global", "true")
                .insert_header("retry-after", "1")
                .set_body_json(json!({"message": "global", "retry_after": 0.15, "global": true})),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = GET_CHANNEL.compile(&[("channel_id", "1")]).unwrap();
    let started = Instant::now();
    rest.execute(&route, &RequestPayload::default()).await.unwrap();

    // The body's fractional value wins over the header.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(140));
    assert!(elapsed < Duration::from_secs(1));
}

#[tokio::test]
async fn long_rate_limit_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(json!({"message": "slow down", "retry_after": 30.0, "global": false})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = GET_CHANNEL.compile(&[("channel_id", "1")]).unwrap();
    let started = Instant::now();
    let err = rest.execute(&route, &RequestPayload::default()).await.unwrap_err();

    match err {
        RestError::RateLimited { retry_after, global, .. } => {
            assert_eq!(retry_after, Duration::from_secs(30));
            assert!(!global);
        }
        other => panic!("expected rate limited, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    // The bucket stays blocked, so the next call is refused without a request.
    let err = rest.execute(&route, &RequestPayload::default()).await.unwrap_err();
    assert!(matches!(err, RestError::RateLimited { global: false, .. }));
}

#[tokio::test]
async fn exhausted_bucket_delays_the_next_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-bucket", "one")
                .insert_header("x-ratelimit-limit", "1")
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("x-ratelimit-reset-after", "0.3"),
        )
        .expect(2)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let route = GET_CHANNEL.compile(&[("channel_id", "1")]).unwrap();
    rest.execute(&route, &RequestPayload::default()).await.unwrap();

    let started = Instant::now();
    rest.execute(&route, &RequestPayload::default()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn other_major_parameters_are_not_delayed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-bucket", "one")
                .insert_header("x-ratelimit-limit", "1")
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("x-ratelimit-reset-after", "5"),
        )
        .mount(&server)
        .await;

    let rest = executor(&server);
    let first = GET_CHANNEL.compile(&[("channel_id", "1")]).unwrap();
    let second = GET_CHANNEL.compile(&[("channel_id", "2")]).unwrap();
    rest.execute(&first, &RequestPayload::default()).await.unwrap();

    let started = Instant::now();
    rest.execute(&second, &RequestPayload::default()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(rest.bucket(&second).unwrap().key, "one;2");
}

#[tokio::test]
async fn routes_sharing_a_hash_share_a_bucket() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(bucket_headers(ResponseTemplate::new(200), "shared", 4, "1.0"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(bucket_headers(ResponseTemplate::new(200), "shared", 3, "1.0"))
        .mount(&server)
        .await;

    let rest = executor(&server);
    let get = GET_CHANNEL.compile(&[("channel_id", "5")]).unwrap();
    let post = POST_CHANNEL_MESSAGES.compile(&[("channel_id", "5")]).unwrap();
    rest.execute(&get, &RequestPayload::default()).await.unwrap();
    rest.execute(&post, &RequestPayload::json(json!({"content": "hi"})))
        .await
        .unwrap();

    assert_eq!(rest.bucket(&get).unwrap().key, "shared;5");
    assert_eq!(rest.bucket(&post).unwrap().key, "shared;5");
    assert_eq!(rest.bucket(&get).unwrap().remaining, 3);
    assert_eq!(rest.registry().len(), 1);
}

#[tokio::test]
async fn unreachable_host_exhausts_retries() {
    let rest = RestExecutor::new(
        RestSettings {
            request_timeout: Duration::from_secs(2),
            ..settings("http://127.0.0.1:1".to_string())
        },
        None,
    )
    .unwrap();

    let route = GET_CHANNEL.compile(&[("channel_id", "1")]).unwrap();
    let err = rest.execute(&route, &RequestPayload::default()).await.unwrap_err();
    match err {
        RestError::RetryExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, RestError::Transport { .. }));
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn gateway_bot_info_is_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gateway/bot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "wss://gateway.discord.gg",
            "shards": 4,
            "session_start_limit": {
                "total": 1000,
                "remaining": 998,
                "reset_after": 3600000,
                "max_concurrency": 2
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let rest = executor(&server);
    let info = fetch_gateway_bot(&rest).await.unwrap();
    assert_eq!(info.url, "wss://gateway.discord.gg");
    assert_eq!(info.shards, 4);
    assert_eq!(info.session_start_limit.max_concurrency, 2);
    assert_eq!(info.session_start_limit.reset_after(), Duration::from_secs(3600));
    rest.close();
}
