//! ActivityPub endpoints
//!
//! - Actor documents
//! - Inboxes (personal and shared) with mandatory signature verification
//! - Followers/Following collections with stable pagination

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use http::HeaderMap;
use serde::Deserialize;

use crate::AppState;
use crate::data::{LocalActor, LocalActorStore};
use crate::error::AppError;
use crate::federation::VerifiedIdentity;
use crate::metrics::{
    FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
};

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

async fn local_actor(state: &AppState, username: &str) -> Result<LocalActor, AppError> {
    state
        .store
        .get_local_actor(username)
        .await?
        .ok_or(AppError::NotFound)
}

/// GET /users/:username
///
/// Returns the ActivityPub actor document, including the public key
/// remote servers verify our signatures against.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/users/:username"])
        .start_timer();

    let account = local_actor(&state, &username).await?;
    let base_url = state.config.server.base_url();
    let actor_url = account.actor_uri(&base_url);

    Ok(Json(serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor_url,
        "preferredUsername": account.username,
        "name": account.display_name.clone().unwrap_or_else(|| account.username.clone()),
        "summary": account.note.clone().unwrap_or_default(),
        "inbox": account.inbox_uri(&base_url),
        "outbox": format!("{actor_url}/outbox"),
        "followers": account.followers_uri(&base_url),
        "following": format!("{actor_url}/following"),
        "url": actor_url,
        "endpoints": {
            "sharedInbox": format!("{base_url}/inbox")
        },
        "publicKey": {
            "id": account.key_id(&base_url),
            "owner": actor_url,
            "publicKeyPem": account.public_key_pem
        }
    })))
}

/// Verify the signature of an inbound inbox POST.
///
/// Runs before any side effect of processing the activity. Returns the
/// verified identity together with the parsed activity document.
async fn verify_inbound(
    state: &AppState,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(VerifiedIdentity, serde_json::Value), AppError> {
    let activity: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("invalid JSON body: {e}")))?;

    let actor_id = activity
        .get("actor")
        .and_then(|a| a.as_str())
        .ok_or_else(|| AppError::Validation("missing actor field".to_string()))?
        .to_string();

    // The signature's key must belong to the actor the activity claims,
    // checked before any remote key material is fetched.
    let key_id = crate::federation::signature::extract_key_id(headers)?;
    if !crate::federation::key_id_matches_actor(&key_id, &actor_id) {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        return Err(AppError::Unauthorized);
    }

    let identity = state
        .verifier
        .verify("POST", path_and_query, headers, Some(body))
        .await?;

    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "accepted"])
        .inc();

    Ok((identity, activity))
}

/// POST /users/:username/inbox
///
/// Receives incoming activities for one local actor.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/users/:username/inbox"])
        .start_timer();

    let account = local_actor(&state, &username).await?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let (identity, activity) = verify_inbound(&state, path_and_query, &headers, &body).await?;

    state.inbox.process(&account, &identity, &activity).await?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /inbox
///
/// Server-wide shared inbox; the target local actor is derived from the
/// activity.
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/inbox"])
        .start_timer();

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let (identity, activity) = verify_inbound(&state, path_and_query, &headers, &body).await?;

    state.inbox.process_shared(&identity, &activity).await?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
}

/// GET /users/:username/followers
///
/// OrderedCollection of follower actor ids, oldest first. Without a
/// `page` parameter only the totals and a pointer to the first page are
/// returned.
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let account = local_actor(&state, &username).await?;
    let base_url = state.config.server.base_url();
    let collection_url = account.followers_uri(&base_url);
    let total = state.registry.count_followers(&account.id).await?;

    let Some(page) = query.page else {
        return Ok(Json(collection_index(&collection_url, total)));
    };

    let page_size = state.config.federation.collection_page_size;
    let items: Vec<String> = state
        .registry
        .list_followers(&account.id, page.max(1), page_size)
        .await?
        .into_iter()
        .map(|relation| relation.remote_actor_id)
        .collect();

    Ok(Json(collection_page(
        &collection_url,
        page.max(1),
        page_size,
        total,
        items,
    )))
}

/// GET /users/:username/following
///
/// Mirror of the followers collection for actors we follow.
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let account = local_actor(&state, &username).await?;
    let base_url = state.config.server.base_url();
    let collection_url = format!("{}/following", account.actor_uri(&base_url));
    let total = state.registry.count_following(&account.id).await?;

    let Some(page) = query.page else {
        return Ok(Json(collection_index(&collection_url, total)));
    };

    let page_size = state.config.federation.collection_page_size;
    let items: Vec<String> = state
        .registry
        .list_following(&account.id, page.max(1), page_size)
        .await?
        .into_iter()
        .map(|relation| relation.remote_actor_id)
        .collect();

    Ok(Json(collection_page(
        &collection_url,
        page.max(1),
        page_size,
        total,
        items,
    )))
}

fn collection_index(collection_url: &str, total: i64) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": collection_url,
        "totalItems": total,
        "first": format!("{collection_url}?page=1")
    })
}

fn collection_page(
    collection_url: &str,
    page: u32,
    page_size: u32,
    total: i64,
    items: Vec<String>,
) -> serde_json::Value {
    let mut document = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollectionPage",
        "id": format!("{collection_url}?page={page}"),
        "partOf": collection_url,
        "totalItems": total,
        "orderedItems": items,
    });

    // A full page may have a successor.
    if i64::from(page) * i64::from(page_size) < total {
        document["next"] = serde_json::json!(format!("{collection_url}?page={}", page + 1));
    }

    document
}
