//! Common test utilities for E2E tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use scorelink::{AppState, config};
use serde::Deserialize;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = test_config(db_path, "https://portal.test.example.net");

        let (state, dispatcher) = AppState::new(config).await.unwrap();
        tokio::spawn(dispatcher.run());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = scorelink::build_router(state.clone());
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
}

/// Build a full configuration suitable for tests
pub fn test_config(db_path: std::path::PathBuf, portal_base: &str) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: config::DatabaseConfig { path: db_path },
        portal: config::PortalConfig {
            base_url: portal_base.to_string(),
            error_path: "/error/".to_string(),
            dispatch_interval_ms: 10,
            queue_high_water: 20,
            request_timeout_seconds: 5,
            page_timeout_seconds: 5,
            friend_cap: 10,
        },
        proxy: config::ProxyConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            allow_hosts: vec!["portal.test.example.net".to_string()],
            callback_host: "127.0.0.1".to_string(),
            callback_path: "/callback".to_string(),
            result_url: "https://app.test.example.net/login/result".to_string(),
        },
        worker: config::WorkerConfig {
            bot_account_id: "bot-1".to_string(),
            tick_seconds: 1,
            acceptance_timeout_seconds: 420,
            confirm_timeout_seconds: 60,
            dead_job_timeout_seconds: 120,
            cooldown_seconds: 300,
            block_grace_seconds: 1,
            watchdog_timeout_seconds: 600,
            probe_interval_seconds: 300,
            jitter_min_ms: 0,
            jitter_max_ms: 1,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// In-process stand-in for the upstream game portal.
///
/// Holds mutable friend/invite/pending lists so tests can simulate the
/// other player's actions, counts hits per endpoint, and can be told to
/// serve its error page for the next N requests or to treat the session
/// as expired.
#[derive(Clone)]
pub struct FakePortal {
    /// `http://127.0.0.1:PORT/`
    pub base_url: String,
    pub friend_hits: Arc<AtomicUsize>,
    pub callback_hits: Arc<AtomicUsize>,
    /// While above zero, friend pages redirect to the error page
    pub fail_next: Arc<AtomicUsize>,
    /// Whether the session probe at /home/ succeeds
    pub session_valid: Arc<AtomicBool>,
    /// Established friendships of the bot account
    pub friends: Arc<Mutex<Vec<String>>>,
    /// Outstanding friend requests the bot has sent
    pub invites: Arc<Mutex<Vec<String>>>,
    /// Incoming requests awaiting the bot's acceptance
    pub pendings: Arc<Mutex<Vec<String>>>,
    /// Friend codes that resolve on the search page
    pub known_codes: Arc<Mutex<HashSet<String>>>,
    /// Anti-forgery token seen on the most recent POST
    pub last_token: Arc<Mutex<Option<String>>>,
}

impl FakePortal {
    pub async fn start() -> Self {
        let portal = Self {
            base_url: String::new(),
            friend_hits: Arc::new(AtomicUsize::new(0)),
            callback_hits: Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(AtomicUsize::new(0)),
            session_valid: Arc::new(AtomicBool::new(true)),
            friends: Arc::new(Mutex::new(vec![
                "634142510810999".to_string(),
                "111122223333444".to_string(),
            ])),
            invites: Arc::new(Mutex::new(Vec::new())),
            pendings: Arc::new(Mutex::new(Vec::new())),
            known_codes: Arc::new(Mutex::new(HashSet::new())),
            last_token: Arc::new(Mutex::new(None)),
        };

        let app = axum::Router::new()
            .route("/friend/", get(friend_page))
            .route("/friend/invite/", get(invite_page))
            .route("/friend/request/", get(request_page))
            .route("/friend/search/", get(search_page))
            .route("/friend/search/invite/", post(send_invite))
            .route("/friend/invite/cancel/", post(cancel_invite))
            .route("/friend/request/accept/", post(accept_request))
            .route("/friend/request/block/", post(block_request))
            .route("/friend/drop/", post(drop_friend))
            .route("/friend/favorite_on/", post(favorite_toggle))
            .route("/friend/favorite_off/", post(favorite_toggle))
            .route("/friend/vs/", get(vs_page))
            .route("/error/", get(error_page))
            .route("/home/", get(home_probe))
            .route("/home/profile/", get(profile_page))
            .route("/callback", get(callback))
            .route("/auth/done", get(auth_done))
            .with_state(portal.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        Self {
            base_url: format!("http://{}/", addr),
            ..portal
        }
    }

    pub fn port(&self) -> u16 {
        url::Url::parse(&self.base_url).unwrap().port().unwrap()
    }

    /// Simulate the target player accepting the bot's friend request
    pub fn accept_invite(&self, code: &str) {
        let mut invites = self.invites.lock().unwrap();
        invites.retain(|c| c != code);
        self.friends.lock().unwrap().push(code.to_string());
    }
}

fn friend_blocks(codes: &[String]) -> String {
    let blocks: String = codes
        .iter()
        .map(|code| format!(r#"<div class="friend_block" data-idx="{code}">{code}</div>"#))
        .collect();
    format!("<html><body>{blocks}</body></html>")
}

async fn friend_page(State(portal): State<FakePortal>) -> axum::response::Response {
    portal.friend_hits.fetch_add(1, Ordering::SeqCst);

    let remaining = portal.fail_next.load(Ordering::SeqCst);
    if remaining > 0 {
        portal.fail_next.store(remaining - 1, Ordering::SeqCst);
        return Redirect::to("/error/").into_response();
    }

    let codes = portal.friends.lock().unwrap().clone();
    axum::response::Html(friend_blocks(&codes)).into_response()
}

async fn invite_page(State(portal): State<FakePortal>) -> axum::response::Html<String> {
    let codes = portal.invites.lock().unwrap().clone();
    axum::response::Html(friend_blocks(&codes))
}

async fn request_page(State(portal): State<FakePortal>) -> axum::response::Html<String> {
    let codes = portal.pendings.lock().unwrap().clone();
    axum::response::Html(friend_blocks(&codes))
}

#[derive(Deserialize)]
struct IdxQuery {
    idx: String,
}

async fn search_page(
    State(portal): State<FakePortal>,
    Query(query): Query<IdxQuery>,
) -> axum::response::Html<String> {
    let known = portal.known_codes.lock().unwrap().contains(&query.idx);
    if known {
        axum::response::Html(format!(
            r#"<html><body><div class="search_result" data-idx="{}">PLAYER</div></body></html>"#,
            query.idx
        ))
    } else {
        axum::response::Html("<html><body><div class=\"search_empty\"></div></body></html>".to_string())
    }
}

#[derive(Deserialize)]
struct IdxForm {
    idx: String,
    token: Option<String>,
}

async fn send_invite(
    State(portal): State<FakePortal>,
    axum::Form(form): axum::Form<IdxForm>,
) -> StatusCode {
    *portal.last_token.lock().unwrap() = form.token;
    portal.invites.lock().unwrap().push(form.idx);
    StatusCode::OK
}

async fn cancel_invite(
    State(portal): State<FakePortal>,
    axum::Form(form): axum::Form<IdxForm>,
) -> StatusCode {
    portal.invites.lock().unwrap().retain(|c| *c != form.idx);
    StatusCode::OK
}

async fn accept_request(
    State(portal): State<FakePortal>,
    axum::Form(form): axum::Form<IdxForm>,
) -> StatusCode {
    portal.pendings.lock().unwrap().retain(|c| *c != form.idx);
    portal.friends.lock().unwrap().push(form.idx);
    StatusCode::OK
}

async fn block_request(
    State(portal): State<FakePortal>,
    axum::Form(form): axum::Form<IdxForm>,
) -> StatusCode {
    portal.pendings.lock().unwrap().retain(|c| *c != form.idx);
    StatusCode::OK
}

async fn drop_friend(
    State(portal): State<FakePortal>,
    axum::Form(form): axum::Form<IdxForm>,
) -> StatusCode {
    portal.friends.lock().unwrap().retain(|c| *c != form.idx);
    StatusCode::OK
}

async fn favorite_toggle(axum::Form(form): axum::Form<IdxForm>) -> StatusCode {
    let _ = form.idx;
    StatusCode::OK
}

#[derive(Deserialize)]
struct VsQuery {
    idx: String,
    diff: u8,
    page: u8,
}

async fn vs_page(Query(query): Query<VsQuery>) -> axum::response::Html<String> {
    let _ = &query.idx;
    axum::response::Html(format!(
        r#"<html><body><div class="vs_container">
             <div class="vs_row">
               <span class="title">Song {diff}-{page}</span>
               <span class="level">13+</span>
               <div class="self"><span class="achievement">99.5421%</span><span class="dx_score">1,234</span></div>
               <div class="rival"><span class="achievement">100.0000%</span><span class="dx_score">1,500</span></div>
             </div>
           </div></body></html>"#,
        diff = query.diff,
        page = query.page,
    ))
}

async fn error_page() -> axum::response::Html<&'static str> {
    axum::response::Html("<html><body>an error occurred</body></html>")
}

async fn home_probe(State(portal): State<FakePortal>) -> axum::response::Response {
    if portal.session_valid.load(Ordering::SeqCst) {
        axum::response::Html("<html><body>home</body></html>").into_response()
    } else {
        Redirect::to("/").into_response()
    }
}

async fn profile_page(headers: HeaderMap) -> axum::response::Response {
    let has_session = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(|cookies| cookies.contains("session="))
        .unwrap_or(false);
    if !has_session {
        return Redirect::to("/").into_response();
    }

    axum::response::Html(
        r#"<html><body>
             <div class="my_code" data-idx="987654321098765">987654321098765</div>
           </body></html>"#,
    )
    .into_response()
}

/// The hijacked OAuth callback: issues the session cookie and redirects,
/// the way the real login flow hands the session over.
async fn callback(State(portal): State<FakePortal>) -> axum::response::Response {
    portal.callback_hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, "/auth/done"),
            (header::SET_COOKIE, "session=test-session-value; Path=/"),
        ],
    )
        .into_response()
}

async fn auth_done() -> axum::response::Html<&'static str> {
    axum::response::Html("<html><body>done</body></html>")
}
