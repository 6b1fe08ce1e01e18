//! E2E tests for discovery endpoints

mod common;

use common::TestServer;

#[tokio::test]
async fn health_check_answers_ok() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn webfinger_resolves_local_actor() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:alice@test.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let descriptor: serde_json::Value = response.json().await.unwrap();
    assert_eq!(descriptor["subject"], "acct:alice@test.example.com");

    let self_link = descriptor["links"]
        .as_array()
        .unwrap()
        .iter()
        .find(|link| link["rel"] == "self")
        .expect("descriptor must carry a self link");
    assert_eq!(
        self_link["href"],
        "http://test.example.com/users/alice"
    );
}

#[tokio::test]
async fn webfinger_unknown_user_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:nobody@test.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn webfinger_foreign_domain_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:alice@other.example"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn webfinger_rejects_non_acct_resource() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=https://test.example.com/users/alice"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn nodeinfo_is_linked_and_served() {
    let server = TestServer::new().await;

    let links: serde_json::Value = server
        .client
        .get(server.url("/.well-known/nodeinfo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(links["links"][0]["href"].as_str().unwrap().ends_with("/nodeinfo/2.0"));

    let nodeinfo: serde_json::Value = server
        .client
        .get(server.url("/nodeinfo/2.0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nodeinfo["software"]["name"], "quillcast");
    assert_eq!(nodeinfo["protocols"][0], "activitypub");
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}
