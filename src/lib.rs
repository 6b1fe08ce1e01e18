//! Quillcast - ActivityPub federation engine for a content-publishing
//! platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Actor documents, inboxes, collections                    │
//! │  - WebFinger discovery                                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation Layer                           │
//! │  - HTTP signatures (two standards)                          │
//! │  - Actor directory, follower registry                       │
//! │  - Outbox fan-out, delivery scheduler                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Repository traits                                        │
//! │  - SQLite (sqlx) / in-memory implementations                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and discovery
//! - `service`: typed operations for host-platform glue
//! - `federation`: signatures, resolution, fan-out, delivery
//! - `data`: repository traits and store implementations
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use data::LocalActorStore;
use federation::{
    ActorDirectory, DeliveryScheduler, FollowRegistry, InboxProcessor, OutboxDispatcher,
    SignatureVerifier, SkewWindow, WebFingerResolver,
};

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains the shared
/// store, caches, and federation components.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Federation store (SQLite in production, in-memory in tests)
    pub store: Arc<dyn data::FederationStore>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// Actor directory (resolution + cache)
    pub directory: ActorDirectory,

    /// Follower/following registry
    pub registry: FollowRegistry,

    /// Inbound signature verification
    pub verifier: Arc<SignatureVerifier>,

    /// Inbound activity processing
    pub inbox: InboxProcessor,

    /// Background delivery worker (spawned by the binary)
    pub scheduler: DeliveryScheduler,

    /// Typed operations for host-platform collaborators
    pub federation: service::FederationService,
}

impl AppState {
    /// Initialize application state backed by SQLite
    ///
    /// # Steps
    /// 1. Connect to the database (runs migrations)
    /// 2. Build the shared HTTP client
    /// 3. Wire the federation components
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = data::Database::connect(&config.database.path).await?;
        tracing::info!("Database connected");

        Self::with_store(config, Arc::new(db))
    }

    /// Initialize application state over any federation store.
    ///
    /// Used by `new` and by tests/hosts substituting their own storage.
    pub fn with_store(
        config: config::AppConfig,
        store: Arc<dyn data::FederationStore>,
    ) -> Result<Self, error::AppError> {
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(concat!("Quillcast/", env!("CARGO_PKG_VERSION")))
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        let base_url = config.server.base_url();

        let directory = ActorDirectory::new(
            http_client.clone(),
            store.clone(),
            base_url.clone(),
            config.federation.actor_cache_ttl(),
        );

        let registry = FollowRegistry::new(store.clone());

        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            directory.clone(),
            registry.clone(),
            base_url.clone(),
        );

        let verifier = Arc::new(SignatureVerifier::new(
            Arc::new(directory.clone()),
            SkewWindow {
                max_age: config.federation.signature_max_age(),
                max_future: std::time::Duration::from_secs(
                    config.federation.signature_max_future_seconds,
                ),
            },
        ));

        let inbox = InboxProcessor::new(
            store.clone(),
            directory.clone(),
            registry.clone(),
            dispatcher.clone(),
            base_url.clone(),
        );

        let scheduler = DeliveryScheduler::new(
            store.clone(),
            registry.clone(),
            http_client.clone(),
            config.federation.signature_scheme.into(),
            base_url.clone(),
            config.federation.delivery.clone(),
        );

        let webfinger =
            WebFingerResolver::with_scheme(http_client.clone(), &config.server.protocol);

        let federation = service::FederationService::new(
            store.clone(),
            directory.clone(),
            registry.clone(),
            dispatcher,
            webfinger,
            config.server.domain.clone(),
            base_url,
        );

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            store,
            http_client,
            directory,
            registry,
            verifier,
            inbox,
            scheduler,
            federation,
        })
    }

    /// Ensure a local actor exists, generating its RSA keypair on first
    /// creation.
    pub async fn ensure_local_actor(
        &self,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<data::LocalActor, error::AppError> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        if let Some(existing) = self.store.get_local_actor(username).await? {
            return Ok(existing);
        }

        tracing::info!(%username, "Creating local actor...");

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, LOCAL_ACTOR_KEY_BITS)
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let now = chrono::Utc::now();
        let actor = data::LocalActor {
            id: data::EntityId::new().0,
            username: username.to_string(),
            display_name: display_name.map(str::to_string),
            note: None,
            private_key_pem,
            public_key_pem,
            created_at: now,
            updated_at: now,
        };

        self.store.upsert_local_actor(&actor).await?;
        tracing::info!(%username, "Local actor created");

        Ok(actor)
    }
}

#[cfg(test)]
const LOCAL_ACTOR_KEY_BITS: usize = 1024;
#[cfg(not(test))]
const LOCAL_ACTOR_KEY_BITS: usize = 2048;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
