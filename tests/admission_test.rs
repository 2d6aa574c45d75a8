//! Coverage of the admission engine's observable behavior end to end:
//! same-key immediate rejection and queue-full rejection.

mod common;

use common::{sign_downstream_request, spawn_mock_upstream, MockOutcome, TestServer};
use std::time::Duration;

#[tokio::test]
async fn second_concurrent_call_with_the_same_key_is_rate_limited() {
    // Upstream sleeps long enough that the first call is still in flight
    // when the second one arrives.
    let upstream = spawn_mock_upstream(MockOutcome::Delayed {
        delay_ms: 300,
        body: r#"{"Data":{"TaskId":"slow"}}"#.to_string(),
    })
    .await;
    let server = TestServer::start(&upstream.base_url(), 2, 8, 0).await;
    let key = server.seed_key("AKIDTEST", "super-secret-value").await;

    let client = reqwest::Client::new();
    let body = br#"{"Request":{}}"#;
    let host = format!("127.0.0.1:{}", server.port);

    let first = {
        let headers = sign_downstream_request("POST", "/v1/submit", "", body, &host, &key.access_key, &key.secret);
        let mut req = client.post(format!("{}/v1/submit", server.base_url())).body(body.to_vec());
        for (name, value) in headers {
            req = req.header(name, value);
        }
        tokio::spawn(async move { req.send().await.unwrap().status() })
    };

    // Give the first request a moment to be admitted before firing the
    // second one with the same key.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let headers = sign_downstream_request("POST", "/v1/submit", "", body, &host, &key.access_key, &key.secret);
    let mut second = client.post(format!("{}/v1/submit", server.base_url())).body(body.to_vec());
    for (name, value) in headers {
        second = second.header(name, value);
    }
    let second_status = second.send().await.unwrap().status();

    assert_eq!(second_status, 429);
    assert_eq!(first.await.unwrap(), 200);

    upstream.shutdown();
}

#[tokio::test]
async fn queue_full_rejects_with_429() {
    let upstream = spawn_mock_upstream(MockOutcome::Delayed {
        delay_ms: 300,
        body: r#"{"Data":{"TaskId":"x"}}"#.to_string(),
    })
    .await;
    // One concurrent slot, no queue room at all: a second distinct key
    // has nowhere to wait and is rejected immediately.
    let server = TestServer::start(&upstream.base_url(), 1, 0, 0).await;
    let key_a = server.seed_key("AKIDA", "secret-a").await;
    let key_b = server.seed_key("AKIDB", "secret-b").await;

    let client = reqwest::Client::new();
    let body = br#"{"Request":{}}"#;
    let host = format!("127.0.0.1:{}", server.port);

    let first = {
        let headers = sign_downstream_request("POST", "/v1/submit", "", body, &host, &key_a.access_key, &key_a.secret);
        let mut req = client.post(format!("{}/v1/submit", server.base_url())).body(body.to_vec());
        for (name, value) in headers {
            req = req.header(name, value);
        }
        tokio::spawn(async move { req.send().await.unwrap().status() })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;

    let headers = sign_downstream_request("POST", "/v1/submit", "", body, &host, &key_b.access_key, &key_b.secret);
    let mut second = client.post(format!("{}/v1/submit", server.base_url())).body(body.to_vec());
    for (name, value) in headers {
        second = second.header(name, value);
    }
    let second_status = second.send().await.unwrap().status();

    assert_eq!(second_status, 429);
    assert_eq!(first.await.unwrap(), 200);

    upstream.shutdown();
}
