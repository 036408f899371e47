//! Telemetry API receiver.
//!
//! The HTTP listener Lambda pushes telemetry batches to once the extension
//! has subscribed. Each batch is a JSON array of [`TelemetryEvent`]
//! envelopes; accepted batches are forwarded on an `mpsc` channel.

use crate::confmap::Conf;
use crate::service::{
    CollectorService, CollectorSettings, ServiceError, ServiceFactory, ServiceState,
};
use crate::telemetry::TelemetryEvent;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Default listener port.
pub const DEFAULT_RECEIVER_PORT: u16 = 53612;

/// Location of the receiver settings in the collector configuration.
pub const RECEIVER_CONFIG_PATH: &str = "receivers::telemetryapi";

/// Hostname the Lambda sandbox resolves to the execution environment.
pub const SANDBOX_HOSTNAME: &str = "sandbox.localdomain";

/// One pushed batch of telemetry events.
pub type TelemetryBatch = Vec<TelemetryEvent>;

/// Receiver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Listener port. `0` picks a free port.
    pub port: u16,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RECEIVER_PORT,
        }
    }
}

impl ReceiverConfig {
    /// Reads the `receivers::telemetryapi` section, falling back to defaults
    /// when it is absent.
    pub fn from_conf(conf: &Conf) -> Result<Self, serde_yaml::Error> {
        Ok(conf.extract(RECEIVER_CONFIG_PATH)?.unwrap_or_default())
    }
}

/// Errors from the receiver service.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    /// The receiver settings are malformed.
    #[error("invalid receiver configuration")]
    Config(#[source] serde_yaml::Error),

    /// The listener could not bind.
    #[error("failed to bind telemetry receiver on {addr}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Bind error.
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("telemetry receiver failed")]
    Serve(#[source] std::io::Error),
}

/// Whether the process runs inside a Lambda execution environment.
pub fn in_lambda() -> bool {
    std::env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some()
}

/// URI Lambda should push telemetry to for a listener on `port`.
pub fn listener_uri(port: u16) -> String {
    let host = if in_lambda() {
        SANDBOX_HOSTNAME
    } else {
        "127.0.0.1"
    };
    format!("http://{host}:{port}")
}

fn bind_address(port: u16) -> SocketAddr {
    if in_lambda() {
        SocketAddr::from(([0, 0, 0, 0], port))
    } else {
        SocketAddr::from(([127, 0, 0, 1], port))
    }
}

/// Builds [`ReceiverService`]s that forward batches to one channel.
#[derive(Debug, Clone)]
pub struct ReceiverFactory {
    batch_tx: mpsc::Sender<TelemetryBatch>,
}

impl ReceiverFactory {
    /// Creates a factory whose services send batches to `batch_tx`.
    pub fn new(batch_tx: mpsc::Sender<TelemetryBatch>) -> Self {
        Self { batch_tx }
    }
}

impl ServiceFactory for ReceiverFactory {
    type Service = ReceiverService;

    fn build(&self, settings: CollectorSettings) -> Result<ReceiverService, ServiceError> {
        let config = ReceiverConfig::from_conf(&settings.config).map_err(ReceiverError::Config)?;

        tracing::debug!(
            build = %settings.build_info,
            port = config.port,
            "Building telemetry receiver"
        );

        Ok(ReceiverService::new(config, self.batch_tx.clone()))
    }
}

/// HTTP listener for Telemetry API pushes.
#[derive(Debug)]
pub struct ReceiverService {
    config: ReceiverConfig,
    batch_tx: mpsc::Sender<TelemetryBatch>,
    cancel_token: CancellationToken,
    state_tx: watch::Sender<ServiceState>,
    local_addr: OnceLock<SocketAddr>,
}

impl ReceiverService {
    /// Creates a receiver in the `Starting` state.
    pub fn new(config: ReceiverConfig, batch_tx: mpsc::Sender<TelemetryBatch>) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::Starting);
        Self {
            config,
            batch_tx,
            cancel_token: CancellationToken::new(),
            state_tx,
            local_addr: OnceLock::new(),
        }
    }

    /// The bound address, once the listener is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Destination URI for the Telemetry API subscription, once bound.
    pub fn listener_uri(&self) -> Option<String> {
        self.local_addr().map(|addr| listener_uri(addr.port()))
    }

    async fn serve(&self) -> Result<(), ReceiverError> {
        let addr = bind_address(self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ReceiverError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ReceiverError::Serve)?;
        let _ = self.local_addr.set(local_addr);

        let state = Arc::new(ReceiverState {
            batch_tx: self.batch_tx.clone(),
            batches_received: AtomicU64::new(0),
        });
        let app = Router::new()
            .route("/", post(handle_batch))
            .route("/health", get(handle_health))
            .with_state(state);

        self.state_tx.send_replace(ServiceState::Running);
        tracing::info!(port = local_addr.port(), "Telemetry receiver started");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel_token.clone().cancelled_owned())
            .await
            .map_err(ReceiverError::Serve)
    }
}

impl CollectorService for ReceiverService {
    fn run(self: Arc<Self>) -> impl Future<Output = Result<(), ServiceError>> + Send {
        async move {
            if self.cancel_token.is_cancelled() {
                self.state_tx.send_replace(ServiceState::Closed);
                return Ok(());
            }

            match self.serve().await {
                Ok(()) => {
                    self.state_tx.send_replace(ServiceState::Closed);
                    tracing::info!("Telemetry receiver stopped");
                    Ok(())
                }
                Err(e) => {
                    self.state_tx.send_replace(ServiceState::Failed);
                    tracing::error!(error = %e, "Telemetry receiver failed");
                    Err(e.into())
                }
            }
        }
    }

    fn shutdown(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == ServiceState::Running {
                *state = ServiceState::Closing;
                true
            } else {
                false
            }
        });
        self.cancel_token.cancel();
    }

    fn state(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ready"` while the listener accepts requests.
    pub status: &'static str,
    /// Number of batches accepted.
    pub batches_received: u64,
}

struct ReceiverState {
    batch_tx: mpsc::Sender<TelemetryBatch>,
    batches_received: AtomicU64,
}

async fn handle_health(State(state): State<Arc<ReceiverState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ready",
        batches_received: state.batches_received.load(Ordering::Relaxed),
    })
}

async fn handle_batch(State(state): State<Arc<ReceiverState>>, body: Bytes) -> impl IntoResponse {
    let batch: TelemetryBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            tracing::error!(error = %e, "Failed to parse telemetry batch");
            return StatusCode::BAD_REQUEST;
        }
    };

    let events = batch.len();
    match state.batch_tx.try_send(batch) {
        Ok(()) => {
            state.batches_received.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(events, "Telemetry batch accepted");
            StatusCode::OK
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("Telemetry batch channel full, signalling backpressure");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::error!("Telemetry batch channel closed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
