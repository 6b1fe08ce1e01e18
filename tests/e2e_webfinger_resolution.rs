//! E2E tests for outbound WebFinger resolution: descriptor fetch, link
//! selection, and the non-authoritative fallback.

use std::sync::Arc;

use axum::{Router, response::Json, routing::get};
use quillcast::federation::webfinger::WebFingerResolver;

/// Serve a fixed JRD descriptor for any webfinger query.
async fn spawn_descriptor_host(descriptor: serde_json::Value) -> String {
    let app = Router::new().route(
        "/.well-known/webfinger",
        get(move || {
            let descriptor = descriptor.clone();
            async move { Json(descriptor) }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr.to_string()
}

#[tokio::test]
async fn resolve_handle_returns_href_of_self_link() {
    let host = spawn_descriptor_host(serde_json::json!({
        "subject": "acct:alice@example.org",
        "links": [
            {
                "rel": "http://webfinger.net/rel/profile-page",
                "type": "text/html",
                "href": "https://example.org/@alice"
            },
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": "https://example.org/users/alice"
            }
        ]
    }))
    .await;

    let resolver = WebFingerResolver::with_scheme(Arc::new(reqwest::Client::new()), "http");
    let resolved = resolver
        .resolve_handle(&format!("@alice@{host}"))
        .await
        .unwrap();

    assert_eq!(resolved.actor_id, "https://example.org/users/alice");
    assert!(resolved.authoritative);
}

#[tokio::test]
async fn descriptor_without_actor_link_falls_back_to_guess() {
    let host = spawn_descriptor_host(serde_json::json!({
        "subject": "acct:alice@example.org",
        "links": [
            {
                "rel": "http://webfinger.net/rel/profile-page",
                "type": "text/html",
                "href": "https://example.org/@alice"
            }
        ]
    }))
    .await;

    let resolver = WebFingerResolver::with_scheme(Arc::new(reqwest::Client::new()), "http");
    let resolved = resolver
        .resolve_handle(&format!("alice@{host}"))
        .await
        .unwrap();

    assert_eq!(resolved.actor_id, format!("http://{host}/users/alice"));
    assert!(!resolved.authoritative, "guesses must be marked as such");
}

#[tokio::test]
async fn unreachable_host_falls_back_to_guess() {
    // Bind then drop: connections to this port are refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    drop(listener);

    let resolver = WebFingerResolver::with_scheme(Arc::new(reqwest::Client::new()), "http");
    let resolved = resolver
        .resolve_handle(&format!("alice@{host}"))
        .await
        .unwrap();

    assert_eq!(resolved.actor_id, format!("http://{host}/users/alice"));
    assert!(!resolved.authoritative);
}

#[tokio::test]
async fn malformed_handles_are_errors_not_guesses() {
    let resolver = WebFingerResolver::with_scheme(Arc::new(reqwest::Client::new()), "http");
    assert!(resolver.resolve_handle("not-a-handle").await.is_err());
}
