//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Router, extract::State, http::StatusCode, routing::post};
use quillcast::data::JobStore;
use quillcast::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance with default configuration
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server, tweaking the configuration first
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for the test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let mut config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: "test.example.com".to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            federation: config::FederationConfig {
                signature_scheme: config::SignatureSchemeConfig::Draft,
                signature_max_age_seconds: 3600,
                signature_max_future_seconds: 300,
                actor_cache_ttl_seconds: 86400,
                collection_page_size: 20,
                delivery: config::DeliveryConfig {
                    max_attempts: 3,
                    base_backoff_seconds: 1,
                    max_backoff_seconds: 4,
                    max_concurrent: 4,
                    poll_interval_seconds: 1,
                    request_timeout_seconds: 5,
                    unreachable_failure_threshold: 3,
                },
            },
            instance: config::InstanceConfig {
                title: "Test Instance".to_string(),
                description: "Quillcast test instance".to_string(),
                contact_email: "test@example.com".to_string(),
                primary_actor: Some("alice".to_string()),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        adjust(&mut config);

        // Initialize app state
        let state = AppState::new(config.clone()).await.unwrap();
        if let Some(ref username) = config.instance.primary_actor {
            state.ensure_local_actor(username, None).await.unwrap();
        }

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Build router
        let app = quillcast::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// The instance base URL as handlers derive it (config-based)
    pub fn base_url(&self) -> String {
        self.state.config.server.base_url()
    }
}

/// What the mock remote inbox saw for one delivery
#[derive(Debug, Clone)]
pub struct ReceivedDelivery {
    pub body: serde_json::Value,
    pub signature: Option<String>,
    pub date: Option<String>,
    pub digest: Option<String>,
}

#[derive(Clone)]
struct RemoteState {
    status: StatusCode,
    received: Arc<Mutex<Vec<ReceivedDelivery>>>,
    hits: Arc<AtomicUsize>,
}

/// A mock remote instance recording inbox deliveries.
pub struct RemoteInstance {
    pub base_url: String,
    received: Arc<Mutex<Vec<ReceivedDelivery>>>,
    hits: Arc<AtomicUsize>,
}

impl RemoteInstance {
    /// Spawn a remote instance whose inbox always answers `status`.
    pub async fn spawn(status: StatusCode) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let remote_state = RemoteState {
            status,
            received: received.clone(),
            hits: hits.clone(),
        };

        let app = Router::new()
            .route("/inbox", post(record_delivery))
            .route("/users/:username/inbox", post(record_delivery))
            .with_state(remote_state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            received,
            hits,
        }
    }

    pub async fn deliveries(&self) -> Vec<ReceivedDelivery> {
        self.received.lock().await.clone()
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn record_delivery(
    State(state): State<RemoteState>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    state.hits.fetch_add(1, Ordering::SeqCst);
    state.received.lock().await.push(ReceivedDelivery {
        body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
        signature: header("signature"),
        date: header("date"),
        digest: header("digest"),
    });

    state.status
}

/// Generate an RSA keypair for a mock remote actor.
pub fn remote_keypair() -> (String, String) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("keygen");
    let public_key = RsaPublicKey::from(&private_key);

    (
        private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private pem")
            .to_string(),
        public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public pem"),
    )
}

/// Build an actor record for a mock remote actor.
pub fn remote_actor_record(
    id: &str,
    inbox: &str,
    shared_inbox: Option<&str>,
    public_key_pem: &str,
) -> quillcast::data::ActorRecord {
    quillcast::data::ActorRecord {
        id: id.to_string(),
        preferred_username: id.rsplit('/').next().unwrap_or("remote").to_string(),
        display_name: None,
        inbox: inbox.to_string(),
        shared_inbox: shared_inbox.map(str::to_string),
        public_key_id: format!("{id}#main-key"),
        public_key_pem: public_key_pem.to_string(),
    }
}

/// Poll the job store until every job of the activity reaches a terminal
/// state, or the timeout elapses.
pub async fn wait_for_terminal_jobs(
    state: &AppState,
    activity_id: &str,
    timeout: std::time::Duration,
) -> Vec<quillcast::data::DeliveryJob> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let jobs = state.store.jobs_for_activity(activity_id).await.unwrap();
        if !jobs.is_empty()
            && jobs
                .iter()
                .all(|job| job.job_state().is_some_and(|s| s.is_terminal()))
        {
            return jobs;
        }
        if tokio::time::Instant::now() >= deadline {
            return jobs;
        }
        let _ = state.scheduler.drain_due().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
