//! Shared test infrastructure for integration tests.
//!
//! Spawns a real `cv-relay` binary against a temp SQLite file and a
//! mock upstream (an in-process axum server), mirroring the teacher's
//! `TestServer`-spawns-a-real-binary convention.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use cv_relay::cipher::{AesGcmCipher, SecretCipher};
use cv_relay::signature::canonical::{canonical_headers, canonical_request, payload_hash};
use cv_relay::signature::{derive_signing_key, hmac_sha256, string_to_sign, CredentialScope, Dialect};
use sqlx::SqlitePool;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::sleep;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

pub const ENCRYPTION_KEY_B64: &str = "MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE=";
pub const REGION: &str = "cn-north-1";
pub const SERVICE: &str = "cv";

/// A downstream API key seeded into the relay's database, plus the
/// cleartext secret needed to sign requests as that caller.
pub struct SeededKey {
    pub access_key: String,
    pub secret: String,
}

/// A spawned `cv-relay` process pointed at a temp SQLite file.
pub struct TestServer {
    process: Child,
    pub port: u16,
    _data_dir: TempDir,
    pub pool: SqlitePool,
}

impl TestServer {
    /// Start a server pointed at `upstream_base_url`, with the given
    /// admission/pacing overrides.
    pub async fn start(upstream_base_url: &str, max_in_flight: usize, max_queue_depth: usize, submit_min_interval_ms: u64) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let data_dir = TempDir::new().expect("create temp dir");
        let db_path = data_dir.path().join("cvrelay.db");
        let database_url = format!("sqlite://{}", db_path.display());

        // Create the schema up front so the test can seed keys before the
        // server process itself has connected.
        let pool = cv_relay::db::connect(&database_url).await.expect("connect db");

        let process = Command::new(env!("CARGO_BIN_EXE_cv-relay"))
            .env("CVRELAY_LISTEN_ADDR", format!("127.0.0.1:{port}"))
            .env("CVRELAY_UPSTREAM_BASE_URL", upstream_base_url)
            .env("CVRELAY_UPSTREAM_ACCESS_KEY_ID", "relay-access-key")
            .env("CVRELAY_UPSTREAM_SECRET_ACCESS_KEY", "relay-secret-key")
            .env("CVRELAY_UPSTREAM_REGION", REGION)
            .env("CVRELAY_UPSTREAM_SERVICE", SERVICE)
            .env("CVRELAY_DATABASE_URL", &database_url)
            .env("CVRELAY_API_KEY_ENCRYPTION_KEY", ENCRYPTION_KEY_B64)
            .env("CVRELAY_MAX_IN_FLIGHT", max_in_flight.to_string())
            .env("CVRELAY_MAX_QUEUE_DEPTH", max_queue_depth.to_string())
            .env("CVRELAY_SUBMIT_MIN_INTERVAL_MS", submit_min_interval_ms.to_string())
            .env("CVRELAY_UPSTREAM_TIMEOUT_MS", "5000")
            .env("CVRELAY_MAX_RETRIES", "2")
            .env("CVRELAY_RETRY_BASE_DELAY_MS", "20")
            .env("CVRELAY_RETRY_MAX_DELAY_MS", "100")
            .env("RUST_LOG", "cv_relay=warn")
            .spawn()
            .expect("failed to start cv-relay");

        let mut server = Self {
            process,
            port,
            _data_dir: data_dir,
            pool,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..100 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(50)).await;
                return;
            }
            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("cv-relay exited before becoming ready: {status}");
            }
            sleep(Duration::from_millis(50)).await;
        }
        let _ = self.process.kill();
        panic!("timed out waiting for cv-relay on {addr}");
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Insert an active API key directly, encrypting the secret the same
    /// way the running server would.
    pub async fn seed_key(&self, access_key: &str, secret: &str) -> SeededKey {
        let key_bytes = base64_decode(ENCRYPTION_KEY_B64);
        let cipher = AesGcmCipher::new(&key_bytes).unwrap();
        let (ciphertext, nonce) = cipher.encrypt(secret.as_bytes()).unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now();

        sqlx::query(
            "INSERT INTO api_keys (id, access_key, secret_ciphertext, secret_nonce, secret_hash, status, expires_at, revoked_at, created_at, updated_at, rotation_of)
             VALUES (?, ?, ?, ?, ?, 'active', NULL, NULL, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(access_key)
        .bind(&ciphertext)
        .bind(&nonce)
        .bind("unused")
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .expect("seed api key");

        SeededKey {
            access_key: access_key.to_string(),
            secret: secret.to_string(),
        }
    }

    pub async fn revoke_key(&self, access_key: &str) {
        sqlx::query("UPDATE api_keys SET status = 'revoked', revoked_at = ? WHERE access_key = ?")
            .bind(chrono::Utc::now())
            .bind(access_key)
            .execute(&self.pool)
            .await
            .expect("revoke api key");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

fn base64_decode(s: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).unwrap()
}

/// Sign a downstream request the way a compliant caller would, returning
/// the header list to attach (Authorization, X-Date, X-Content-Sha256).
pub fn sign_downstream_request(
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
    host: &str,
    access_key: &str,
    secret: &str,
) -> Vec<(&'static str, String)> {
    let x_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let date_short = x_date[..8].to_string();
    let hashed_body = payload_hash(body);

    let scope = CredentialScope {
        date_short,
        region: REGION.to_string(),
        service: SERVICE.to_string(),
        dialect: Dialect::Aws4,
    };

    let mut headers = axum::http::HeaderMap::new();
    headers.insert("host", host.parse().unwrap());
    headers.insert("x-date", x_date.parse().unwrap());
    headers.insert("x-content-sha256", hashed_body.parse().unwrap());

    let signed_header_names = vec!["host".to_string(), "x-content-sha256".to_string(), "x-date".to_string()];
    let (canonical_headers_block, signed_headers) = canonical_headers(&signed_header_names, &headers, Some(host));

    let canonical = canonical_request(method, path, query, &canonical_headers_block, &signed_headers, &hashed_body);
    let sts = string_to_sign(Dialect::Aws4, &x_date, &scope, &canonical);
    let signing_key = derive_signing_key(secret, &scope);
    let signature = hex::encode(hmac_sha256(&signing_key, sts.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        access_key,
        scope.scope_string(),
        signed_headers,
        signature
    );

    vec![
        ("Authorization", authorization),
        ("X-Date", x_date),
        ("X-Content-Sha256", hashed_body),
    ]
}

/// Outcome a mock upstream should return for the next call(s).
#[derive(Clone)]
pub enum MockOutcome {
    Json { status: u16, body: String },
    /// Returns this status the first `fail_times` calls, then `Json`.
    FailThenSucceed { fail_times: u32, fail_status: u16, body: String },
    /// Sleeps before responding 200, widening the window in which a
    /// concurrent second call can observe the first as still in flight.
    Delayed { delay_ms: u64, body: String },
}

pub struct MockUpstream {
    addr: std::net::SocketAddr,
    shutdown: tokio::sync::oneshot::Sender<()>,
    calls: Arc<AtomicU32>,
}

impl MockUpstream {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of requests the mock upstream has received so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
    }
}

#[derive(Clone)]
struct MockState {
    outcome: MockOutcome,
    calls: Arc<AtomicU32>,
}

async fn mock_handler(State(state): State<MockState>) -> axum::response::Response {
    let call_number = state.calls.fetch_add(1, Ordering::SeqCst) + 1;

    match state.outcome {
        MockOutcome::Json { status, body } => {
            (StatusCode::from_u16(status).unwrap(), [("content-type", "application/json")], body).into_response()
        }
        MockOutcome::FailThenSucceed { fail_times, fail_status, body } => {
            if call_number <= fail_times {
                (
                    StatusCode::from_u16(fail_status).unwrap(),
                    [("content-type", "application/json")],
                    "{\"error\":\"retry me\"}".to_string(),
                )
                    .into_response()
            } else {
                (StatusCode::OK, [("content-type", "application/json")], body).into_response()
            }
        }
        MockOutcome::Delayed { delay_ms, body } => {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            (StatusCode::OK, [("content-type", "application/json")], body).into_response()
        }
    }
}

/// Spin up a minimal in-process upstream that always returns `outcome`.
pub async fn spawn_mock_upstream(outcome: MockOutcome) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let state = MockState {
        outcome,
        calls: calls.clone(),
    };
    let app = Router::new().route("/", post(mock_handler)).with_state(state);

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    MockUpstream { addr, shutdown: tx, calls }
}
