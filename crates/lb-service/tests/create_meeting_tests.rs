//! End-to-end tests for routed meeting creation.
//!
//! Drives `/bigbluebutton/api/create` through the real router with a mock
//! backend behind it.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use lb_service::services::MockBackendClient;
use lb_test_utils::{backend_meeting, signed_query, TestLbServer};

const HOST: &str = "bbb.acme.test";
const SECRET: &str = "acme-secret";

async fn acme_server(backend: MockBackendClient) -> Result<TestLbServer, anyhow::Error> {
    let server = TestLbServer::spawn_with(backend).await?;
    server.add_tenant("acme", HOST, SECRET).await?;
    Ok(server)
}

async fn create(server: &TestLbServer, query: &str) -> Result<(u16, String), anyhow::Error> {
    let response = reqwest::Client::new()
        .get(format!("{}/bigbluebutton/api/create?{query}", server.url()))
        .header("Host", HOST)
        .send()
        .await?;
    let status = response.status().as_u16();
    Ok((status, response.text().await?))
}

#[tokio::test]
async fn test_create_routes_to_least_loaded_server() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;
    server.backend().set_meetings(
        "bbb1",
        vec![backend_meeting("a*other", 10), backend_meeting("b*other", 4)],
    );
    server.add_healthy_server("bbb1").await?;
    server.add_healthy_server("bbb2").await?;

    let query = signed_query("create", &[("meetingID", "daily"), ("name", "Daily")], SECRET);
    let (status, body) = create(&server, &query).await?;

    assert_eq!(status, 200);
    assert!(body.contains("<returncode>SUCCESS</returncode>"), "{body}");
    // The scoped backend id is rewritten back to the tenant's id.
    assert!(body.contains("<meetingID>daily</meetingID>"), "{body}");
    assert!(!body.contains("daily*acme"), "{body}");

    let created = server.backend().created();
    assert_eq!(created.len(), 1);
    let (server_id, params) = &created[0];
    assert_eq!(server_id, "bbb2");
    assert_eq!(params["meetingID"], "daily*acme");
    assert_eq!(params["meta_bbblb-tenant"], "acme");
    assert_eq!(params["meta_bbblb-server"], "bbb2");
    assert_eq!(params["meta_bbblb-origin"], "lb.test");
    assert!(!params.contains_key("checksum"));

    let meeting = server.state().meetings.find_open("acme", "daily").expect("meeting recorded");
    assert_eq!(params["meta_bbblb-uuid"], meeting.uuid.to_string());
    assert!(server.store().meeting(meeting.uuid).is_some());

    Ok(())
}

#[tokio::test]
async fn test_repeated_create_reuses_server() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;
    server.add_healthy_server("bbb1").await?;
    server.add_healthy_server("bbb2").await?;

    let query = signed_query("create", &[("meetingID", "daily")], SECRET);
    let (first, _) = create(&server, &query).await?;
    let (second, _) = create(&server, &query).await?;
    assert_eq!(first, 200);
    assert_eq!(second, 200);

    let created = server.backend().created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].0, created[1].0);
    assert_eq!(created[0].1["meta_bbblb-uuid"], created[1].1["meta_bbblb-uuid"]);
    assert_eq!(server.state().meetings.open_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_form_encoded_post_is_accepted() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;
    server.add_healthy_server("bbb1").await?;

    let form = signed_query("create", &[("meetingID", "weekly"), ("name", "Weekly")], SECRET);
    let response = reqwest::Client::new()
        .post(format!("{}/bigbluebutton/api/create", server.url()))
        .header("Host", HOST)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(form)
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert!(response.text().await?.contains("SUCCESS"));
    assert_eq!(server.backend().created()[0].1["name"], "Weekly");

    Ok(())
}

#[tokio::test]
async fn test_large_preupload_document_is_forwarded() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;
    server.add_healthy_server("bbb1").await?;

    // Larger than axum's default 2 MB body limit.
    let mut document = String::from("<modules><module name=\"presentation\"><document name=\"slides.pdf\">");
    document.push_str(&"A".repeat(3 * 1024 * 1024));
    document.push_str("</document></module></modules>");
    let size = document.len();

    let query = signed_query("create", &[("meetingID", "daily")], SECRET);
    let response = reqwest::Client::new()
        .post(format!("{}/bigbluebutton/api/create?{query}", server.url()))
        .header("Host", HOST)
        .header("Content-Type", "application/xml")
        .body(document)
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert!(response.text().await?.contains("SUCCESS"));
    assert_eq!(server.backend().document_sizes(), vec![Some(size)]);

    Ok(())
}

#[tokio::test]
async fn test_tenant_overrides_are_applied() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;
    server.add_healthy_server("bbb1").await?;
    server.admin().set_override("acme", "record=false").await?;
    server.admin().set_override("acme", "maxParticipants<50").await?;

    let query = signed_query(
        "create",
        &[("meetingID", "daily"), ("record", "true"), ("maxParticipants", "200")],
        SECRET,
    );
    let (status, _) = create(&server, &query).await?;
    assert_eq!(status, 200);

    let params = &server.backend().created()[0].1;
    assert_eq!(params["record"], "false");
    assert_eq!(params["maxParticipants"], "50");

    Ok(())
}

#[tokio::test]
async fn test_bad_checksum_returns_checksum_error() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;
    server.add_healthy_server("bbb1").await?;

    let query = signed_query("create", &[("meetingID", "daily")], "wrong-secret");
    let (status, body) = create(&server, &query).await?;

    assert_eq!(status, 200);
    assert!(body.contains("<returncode>FAILED</returncode>"), "{body}");
    assert!(body.contains("<messageKey>checksumError</messageKey>"), "{body}");
    assert_eq!(server.backend().create_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_unknown_host_is_not_found() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;

    let query = signed_query("create", &[("meetingID", "daily")], SECRET);
    let response = reqwest::Client::new()
        .get(format!("{}/bigbluebutton/api/create?{query}", server.url()))
        .header("Host", "bbb.unknown.test")
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert!(response.text().await?.contains("<messageKey>notFound</messageKey>"));

    Ok(())
}

#[tokio::test]
async fn test_missing_meeting_id_is_validation_error() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;
    server.add_healthy_server("bbb1").await?;

    let query = signed_query("create", &[("name", "No id")], SECRET);
    let (status, body) = create(&server, &query).await?;

    assert_eq!(status, 200);
    assert!(body.contains("<messageKey>validationError</messageKey>"), "{body}");

    Ok(())
}

#[tokio::test]
async fn test_no_healthy_server_returns_503() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;

    let query = signed_query("create", &[("meetingID", "daily")], SECRET);
    let (status, body) = create(&server, &query).await?;

    assert_eq!(status, 503);
    assert!(body.contains("<messageKey>noServerAvailable</messageKey>"), "{body}");
    assert!(server.state().meetings.find_open("acme", "daily").is_none());

    Ok(())
}

#[tokio::test]
async fn test_backend_failure_releases_reservation() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::unreachable()).await?;
    let entry = server.add_healthy_server("bbb1").await?;

    let query = signed_query("create", &[("meetingID", "daily")], SECRET);
    let (status, body) = create(&server, &query).await?;

    assert_eq!(status, 502);
    assert!(body.contains("<messageKey>internalError</messageKey>"), "{body}");
    assert_eq!(entry.in_flight(), 0);
    assert!(server.state().meetings.find_open("acme", "daily").is_none());

    Ok(())
}

#[tokio::test]
async fn test_backend_refusal_is_passed_through() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::rejecting("idNotUnique")).await?;
    let entry = server.add_healthy_server("bbb1").await?;

    let query = signed_query("create", &[("meetingID", "daily")], SECRET);
    let (status, body) = create(&server, &query).await?;

    assert_eq!(status, 200);
    assert!(body.contains("<messageKey>idNotUnique</messageKey>"), "{body}");
    assert_eq!(entry.in_flight(), 0);
    assert!(server.state().meetings.find_open("acme", "daily").is_none());

    Ok(())
}

#[tokio::test]
async fn test_disabled_tenant_is_refused() -> Result<(), anyhow::Error> {
    let server = acme_server(MockBackendClient::accepting()).await?;
    server.add_healthy_server("bbb1").await?;
    server.admin().set_tenant_enabled("acme", false).await?;

    let query = signed_query("create", &[("meetingID", "daily")], SECRET);
    let (status, body) = create(&server, &query).await?;

    assert_eq!(status, 200);
    assert!(body.contains("<returncode>FAILED</returncode>"), "{body}");
    assert_eq!(server.backend().create_count(), 0);

    Ok(())
}
