//! Health endpoint integration tests.
//!
//! Tests the `/health` (liveness), `/ready` (readiness) and `/metrics`
//! endpoints using the `TestLbServer` harness.

use lb_test_utils::TestLbServer;

/// Test that /health liveness endpoint returns 200 and plain text "OK".
#[tokio::test]
async fn test_health_endpoint_returns_200() -> Result<(), anyhow::Error> {
    let server = TestLbServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/health", server.url())).send().await?;

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "OK");

    Ok(())
}

/// Test that /ready reports the store and flips to 503 when it is down.
#[tokio::test]
async fn test_ready_endpoint_follows_store() -> Result<(), anyhow::Error> {
    let server = TestLbServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/ready", server.url())).send().await?;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["store"], "healthy");

    server.store().set_unavailable(true);
    let response = client.get(format!("{}/ready", server.url())).send().await?;
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["store"], "unhealthy");

    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text() -> Result<(), anyhow::Error> {
    let server = TestLbServer::spawn().await?;

    let response = reqwest::get(format!("{}/metrics", server.url())).await?;

    assert_eq!(response.status(), 200);
    Ok(())
}

#[tokio::test]
async fn test_api_index() -> Result<(), anyhow::Error> {
    let server = TestLbServer::spawn().await?;
    let client = reqwest::Client::new();

    for path in ["/bigbluebutton/api", "/bigbluebutton/api/"] {
        let response = client.get(format!("{}{path}", server.url())).send().await?;
        assert_eq!(response.status(), 200);
        let body = response.text().await?;
        assert!(body.contains("<returncode>SUCCESS</returncode>"), "{path}: {body}");
    }

    Ok(())
}
