//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use fedi_delivery::config::{AppConfig, HttpClientConfig};
use fedi_delivery::httpclient::Client;
use fedi_delivery::{AppState, build_router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::time::Instant;
use url::Url;

static METRICS: Once = Once::new();

/// Register metrics once per test binary
pub fn init_metrics() {
    METRICS.call_once(fedi_delivery::metrics::init_metrics);
}

/// Client configuration that may dial the loopback test servers
pub fn loopback_client_config() -> HttpClientConfig {
    HttpClientConfig {
        allow_ranges: vec!["127.0.0.1/32".to_string()],
        timeout_seconds: 10,
        ..Default::default()
    }
}

/// Safe client that may dial the loopback test servers
pub fn loopback_client() -> Arc<Client> {
    Arc::new(Client::new(&loopback_client_config()).expect("client builds"))
}

/// Body shape of a scripted reply
#[derive(Debug, Clone)]
pub enum ReplyBody {
    Empty,
    /// Body of `n` bytes with a Content-Length header
    Sized(usize),
    /// Chunked body of `chunks` x `chunk_size` bytes without Content-Length
    Streamed { chunk_size: usize, chunks: usize },
}

/// Scripted reply of the remote inbox
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub delay: Duration,
    pub headers: Vec<(&'static str, String)>,
    pub body: ReplyBody,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            delay: Duration::ZERO,
            headers: Vec::new(),
            body: ReplyBody::Empty,
        }
    }

    pub fn accepted() -> Self {
        Self::status(202)
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn sized_body(mut self, len: usize) -> Self {
        self.body = ReplyBody::Sized(len);
        self
    }

    pub fn streamed_body(mut self, chunk_size: usize, chunks: usize) -> Self {
        self.body = ReplyBody::Streamed { chunk_size, chunks };
        self
    }

    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match self.body {
            ReplyBody::Empty => Body::empty(),
            ReplyBody::Sized(len) => Body::from(vec![b'x'; len]),
            ReplyBody::Streamed { chunk_size, chunks } => {
                let stream = futures::stream::iter((0..chunks).map(move |_| {
                    Ok::<_, std::io::Error>(Bytes::from(vec![b'y'; chunk_size]))
                }));
                Body::from_stream(stream)
            }
        };

        let mut response = (status, body).into_response();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

/// One request seen by the remote inbox
#[derive(Debug, Clone)]
pub struct Received {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub at: Instant,
}

#[derive(Default)]
struct Plan {
    scripted: VecDeque<Reply>,
    then: Option<Reply>,
}

#[derive(Default)]
struct InboxState {
    received: Mutex<Vec<Received>>,
    plans: Mutex<HashMap<String, Plan>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InboxState {
    fn next_reply(&self, path: &str) -> Reply {
        let mut plans = self.plans.lock();
        match plans.get_mut(path) {
            Some(plan) => plan
                .scripted
                .pop_front()
                .or_else(|| plan.then.clone())
                .unwrap_or_else(Reply::accepted),
            None => Reply::accepted(),
        }
    }
}

/// Recording stand-in for remote inboxes, listening on 127.0.0.1
pub struct RemoteInbox {
    pub addr: SocketAddr,
    state: Arc<InboxState>,
}

impl RemoteInbox {
    /// Start a new inbox server on a random port
    pub async fn start() -> Self {
        let state = Arc::new(InboxState::default());

        let app = Router::new()
            .fallback(handle)
            .with_state(state.clone());

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// URL of `path` on this server
    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).unwrap()
    }

    /// Answer `path` with `replies` in order, then with 202
    pub fn script(&self, path: &str, replies: impl IntoIterator<Item = Reply>) {
        let mut plans = self.state.plans.lock();
        plans
            .entry(path.to_string())
            .or_default()
            .scripted
            .extend(replies);
    }

    /// Answer `path` with `reply` once the script is exhausted
    pub fn route(&self, path: &str, reply: Reply) {
        let mut plans = self.state.plans.lock();
        plans.entry(path.to_string()).or_default().then = Some(reply);
    }

    /// Every request seen so far
    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    /// Requests seen for `path`
    pub fn received_for(&self, path: &str) -> Vec<Received> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// Number of requests seen
    pub fn count(&self) -> usize {
        self.state.received.lock().len()
    }

    /// Number of requests seen for `path`
    pub fn count_for(&self, path: &str) -> usize {
        self.state
            .received
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    /// Highest number of requests handled at the same time
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until `path` has been requested `count` times
    pub async fn wait_for_path(&self, path: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count_for(path) >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count_for(path) >= count
    }

    /// Wait until `count` requests have been seen in total
    pub async fn wait_for_total(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count() >= count
    }
}

struct InFlight<'a>(&'a InboxState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a InboxState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle(
    State(state): State<Arc<InboxState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _in_flight = InFlight::enter(&state);
    let path = uri.path().to_string();

    state.received.lock().push(Received {
        method,
        path: path.clone(),
        headers,
        body,
        at: Instant::now(),
    });

    let reply = state.next_reply(&path);
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    reply.into_response()
}

/// Operations endpoint instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        init_metrics();

        let mut config = AppConfig::default();
        config.http_client = loopback_client_config();
        config.server.port = 0;
        config.delivery.pool_size = 2;

        let state = AppState::new(config).unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr_str,
            state,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}
