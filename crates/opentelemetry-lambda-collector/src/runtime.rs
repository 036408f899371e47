//! Extension runtime orchestrator.
//!
//! Drives the extension from registration to shutdown:
//! 1. Registers with the Extensions API
//! 2. Resolves the collector configuration
//! 3. Starts the collector and waits for its receiver to be ready
//! 4. Subscribes the receiver to the Telemetry API
//! 5. Polls lifecycle events until `SHUTDOWN` or a termination signal
//! 6. Stops the collector
//!
//! Failures in steps 1 to 3 are fatal. A subscription failure is logged and
//! only fatal when `telemetry_api.required` is set.

use crate::build_info::BuildInfo;
use crate::collector::{Collector, CollectorError};
use crate::config::Config;
use crate::confmap::{ConfigResolver, ResolveError};
use crate::extension_api::{ExtensionApiClient, ExtensionApiError, NextEvent};
use crate::receiver::{ReceiverFactory, TelemetryBatch};
use crate::service::CollectorSettings;
use crate::telemetry_api::{TelemetryApiClient, TelemetryApiError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the channel between the receiver and the batch consumer.
pub const BATCH_CHANNEL_CAPACITY: usize = 64;

/// Extension runtime that orchestrates all components.
#[derive(Debug)]
pub struct ExtensionRuntime {
    config: Config,
    build_info: BuildInfo,
    cancel_token: CancellationToken,
}

impl ExtensionRuntime {
    /// Creates a new extension runtime with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            build_info: BuildInfo::current(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Overrides the build metadata passed to the collector.
    pub fn with_build_info(mut self, build_info: BuildInfo) -> Self {
        self.build_info = build_info;
        self
    }

    /// Returns a token that ends the event loop when cancelled, as a
    /// `SHUTDOWN` event would.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs the extension until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if registration, configuration resolution or
    /// collector startup fails, if a required subscription fails, if the
    /// event loop fails, or if the collector reports a failure on stop.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let runtime_api = self
            .config
            .runtime_api_url()
            .ok_or(RuntimeError::MissingRuntimeApi)?;

        let mut extensions = ExtensionApiClient::new(&runtime_api);
        let registration = extensions
            .register(&self.config.extension.name)
            .await
            .map_err(RuntimeError::Register)?;

        let resolver = ConfigResolver::new(self.config.collector.config_uris.iter().cloned());
        tracing::debug!(?resolver, "Resolving collector configuration");
        let conf = resolver.resolve().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to resolve collector configuration");
            RuntimeError::Resolve(e)
        })?;

        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let drain_task = tokio::spawn(drain_batches(batch_rx));

        let settings = CollectorSettings {
            build_info: self.build_info.clone(),
            config: conf,
        };
        let mut collector = Collector::new(ReceiverFactory::new(batch_tx), settings)
            .with_startup_timeout(self.config.collector.startup_timeout);

        let outcome = match collector.start().await {
            Ok(()) => {
                self.serve(&runtime_api, &extensions, &registration.extension_id, &collector)
                    .await
            }
            Err(e) => Err(RuntimeError::Start(e)),
        };

        let stopped = collector.stop().await.map_err(RuntimeError::Stop);
        drop(collector);
        join_drain(drain_task).await;

        if let Err(e) = &stopped {
            tracing::error!(error = %e, "Collector did not stop cleanly");
        }
        tracing::debug!(?outcome, "Extension finished");

        outcome.and(stopped)
    }

    async fn serve(
        &self,
        runtime_api: &str,
        extensions: &ExtensionApiClient,
        extension_id: &str,
        collector: &Collector<ReceiverFactory>,
    ) -> Result<(), RuntimeError> {
        if self.config.telemetry_api.enabled {
            let listener_uri = collector
                .service()
                .and_then(|service| service.listener_uri())
                .ok_or(RuntimeError::ListenerUnavailable)?;
            self.subscribe(runtime_api, extension_id, &listener_uri)
                .await?;
        } else {
            tracing::info!("Telemetry API subscription disabled");
        }

        self.event_loop(extensions).await
    }

    async fn subscribe(
        &self,
        runtime_api: &str,
        extension_id: &str,
        listener_uri: &str,
    ) -> Result<(), RuntimeError> {
        let result = match TelemetryApiClient::new(runtime_api, &self.config.telemetry_api) {
            Ok(client) => client.subscribe(extension_id, listener_uri).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => Ok(()),
            Err(TelemetryApiError::NotSupported { .. }) => {
                tracing::warn!("Continuing without Telemetry API delivery");
                Ok(())
            }
            Err(e) if self.config.telemetry_api.required => {
                tracing::error!(error = %e, "Telemetry API subscription is required");
                Err(RuntimeError::Subscribe(e))
            }
            Err(e) => {
                tracing::error!(error = %e, "Continuing without Telemetry API subscription");
                Ok(())
            }
        }
    }

    async fn event_loop(&self, extensions: &ExtensionApiClient) -> Result<(), RuntimeError> {
        let signal = wait_for_shutdown_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    tracing::info!("Shutdown requested");
                    return Ok(());
                }
                received = &mut signal => {
                    received.map_err(RuntimeError::Signal)?;
                    tracing::info!("Received termination signal");
                    return Ok(());
                }
                event = extensions.next_event() => {
                    match event.map_err(RuntimeError::NextEvent)? {
                        NextEvent::Invoke { request_id, .. } => {
                            tracing::debug!(%request_id, "Invocation started");
                        }
                        NextEvent::Shutdown { shutdown_reason, .. } => {
                            tracing::info!(reason = ?shutdown_reason, "Received SHUTDOWN event");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

async fn drain_batches(mut batch_rx: mpsc::Receiver<TelemetryBatch>) {
    while let Some(batch) = batch_rx.recv().await {
        tracing::debug!(events = batch.len(), "Received telemetry batch");
        for event in &batch {
            tracing::trace!(time = %event.time, event_type = %event.event_type, "Telemetry event");
        }
    }
}

async fn join_drain(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        tracing::error!(error = %e, "Telemetry batch consumer panicked");
    }
}

/// Completes when the process receives SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Errors from the extension runtime.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No Runtime API address is configured.
    #[error("AWS_LAMBDA_RUNTIME_API is not set")]
    MissingRuntimeApi,

    /// Extension registration failed.
    #[error("failed to register extension")]
    Register(#[source] ExtensionApiError),

    /// Collector configuration could not be resolved.
    #[error("failed to resolve collector configuration")]
    Resolve(#[source] ResolveError),

    /// The collector did not start.
    #[error("failed to start collector")]
    Start(#[source] CollectorError),

    /// The collector failed while stopping.
    #[error("collector failed during shutdown")]
    Stop(#[source] CollectorError),

    /// A required Telemetry API subscription failed.
    #[error("failed to subscribe to Telemetry API")]
    Subscribe(#[source] TelemetryApiError),

    /// The receiver reported ready without a bound address.
    #[error("telemetry receiver has no listener address")]
    ListenerUnavailable,

    /// Polling for lifecycle events failed.
    #[error("failed to receive next lifecycle event")]
    NextEvent(#[source] ExtensionApiError),

    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers")]
    Signal(#[source] std::io::Error),
}
