//! Shared test utilities for the collector extension integration tests.
//!
//! [`MockLambdaHost`] serves the subset of the Lambda Runtime API the
//! extension talks to: registration, `event/next` and the Telemetry API
//! subscription, with a scripted subscription response.

#![allow(dead_code)]

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Identifier the mock host issues on registration.
pub const EXTENSION_ID: &str = "6f1c2a3b-test-extension";

/// A request received by the mock Telemetry API.
#[derive(Debug, Clone)]
pub struct RecordedSubscription {
    pub extension_id: Option<String>,
    pub content_type: Option<String>,
    pub body: Value,
}

struct HostState {
    telemetry_status: StatusCode,
    telemetry_body: String,
    subscriptions: Mutex<Vec<RecordedSubscription>>,
    registrations: Mutex<Vec<String>>,
    events: Mutex<VecDeque<Value>>,
    event_ready: Notify,
}

/// In-process stand-in for the Lambda Runtime API.
pub struct MockLambdaHost {
    addr: SocketAddr,
    state: Arc<HostState>,
    server: JoinHandle<()>,
}

impl MockLambdaHost {
    /// Starts a host whose Telemetry API answers with `status` and `body`.
    pub async fn start(status: u16, body: &str) -> Self {
        let state = Arc::new(HostState {
            telemetry_status: StatusCode::from_u16(status).expect("valid status code"),
            telemetry_body: body.to_string(),
            subscriptions: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            event_ready: Notify::new(),
        });

        let app = Router::new()
            .route("/2020-01-01/extension/register", post(register))
            .route("/2020-01-01/extension/event/next", get(next_event))
            .route("/2022-07-01/telemetry", put(subscribe))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock host");
        let addr = listener.local_addr().expect("mock host address");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            server,
        }
    }

    /// Starts a host whose Telemetry API accepts every subscription.
    pub async fn accepting() -> Self {
        Self::start(200, "OK").await
    }

    /// `host:port`, as Lambda puts it in `AWS_LAMBDA_RUNTIME_API`.
    pub fn runtime_api(&self) -> String {
        self.addr.to_string()
    }

    /// Base URL of the host.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Subscriptions received so far.
    pub fn subscriptions(&self) -> Vec<RecordedSubscription> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    /// Extension names registered so far.
    pub fn registrations(&self) -> Vec<String> {
        self.state.registrations.lock().unwrap().clone()
    }

    /// Queues a lifecycle event for `event/next`.
    pub fn push_event(&self, event: Value) {
        self.state.events.lock().unwrap().push_back(event);
        self.state.event_ready.notify_one();
    }

    /// Queues a `SHUTDOWN` event.
    pub fn push_shutdown(&self) {
        self.push_event(json!({
            "eventType": "SHUTDOWN",
            "shutdownReason": "spindown",
            "deadlineMs": 1_700_000_002_000u64
        }));
    }

    /// Waits until at least one subscription has arrived.
    pub async fn wait_for_subscription(
        &self,
        timeout: Duration,
    ) -> Result<RecordedSubscription, String> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(first) = self.subscriptions().into_iter().next() {
                return Ok(first);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(format!("no subscription received within {:?}", timeout))
    }
}

impl Drop for MockLambdaHost {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn register(State(state): State<Arc<HostState>>, headers: HeaderMap) -> Response {
    let Some(name) = header(&headers, "Lambda-Extension-Name") else {
        return (StatusCode::BAD_REQUEST, "Missing Lambda-Extension-Name header").into_response();
    };
    state.registrations.lock().unwrap().push(name);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        "Lambda-Extension-Identifier",
        HeaderValue::from_static(EXTENSION_ID),
    );

    (
        StatusCode::OK,
        response_headers,
        Json(json!({
            "functionName": "test-function",
            "functionVersion": "$LATEST",
            "handler": "index.handler"
        })),
    )
        .into_response()
}

async fn next_event(State(state): State<Arc<HostState>>, headers: HeaderMap) -> Response {
    if header(&headers, "Lambda-Extension-Identifier").as_deref() != Some(EXTENSION_ID) {
        return (StatusCode::FORBIDDEN, "Extension not registered").into_response();
    }

    loop {
        let notified = state.event_ready.notified();
        if let Some(event) = state.events.lock().unwrap().pop_front() {
            return Json(event).into_response();
        }
        notified.await;
    }
}

async fn subscribe(
    State(state): State<Arc<HostState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state
        .subscriptions
        .lock()
        .unwrap()
        .push(RecordedSubscription {
            extension_id: header(&headers, "Lambda-Extension-Identifier"),
            content_type: header(&headers, "Content-Type"),
            body,
        });

    (state.telemetry_status, state.telemetry_body.clone()).into_response()
}

/// Returns a local port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    listener.local_addr().expect("probe address").port()
}
