//! The seam between the lifecycle coordinator and a concrete collector
//! service.
//!
//! A [`ServiceFactory`] turns [`CollectorSettings`] into a
//! [`CollectorService`]. The coordinator then drives the service through
//! [`CollectorService::run`] on its own task, watches its
//! [`ServiceState`], and requests termination with
//! [`CollectorService::shutdown`].

use crate::build_info::BuildInfo;
use crate::confmap::Conf;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Error type for service construction and run failures.
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle state reported by a running service.
///
/// Only the service writes it; the coordinator reads it through a
/// [`watch::Receiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Initialising, not yet accepting work.
    Starting,
    /// Ready.
    Running,
    /// Shutdown requested, draining.
    Closing,
    /// Shut down cleanly.
    Closed,
    /// Failed irrecoverably.
    Failed,
}

impl ServiceState {
    /// Whether the service can no longer become ready.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a factory needs to build a service.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Build metadata of this binary.
    pub build_info: BuildInfo,
    /// Resolved collector configuration.
    pub config: Conf,
}

/// A long-running collector service.
pub trait CollectorService: Send + Sync + 'static {
    /// Runs the service until it terminates.
    ///
    /// Returns once the service has fully stopped, either because
    /// [`shutdown`](Self::shutdown) was called or because it failed.
    fn run(self: Arc<Self>) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Requests termination. Must not block.
    fn shutdown(&self);

    /// Subscribes to state changes.
    fn state(&self) -> watch::Receiver<ServiceState>;
}

/// Builds collector services from settings.
pub trait ServiceFactory {
    /// Service type produced.
    type Service: CollectorService;

    /// Builds a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot produce a working service.
    fn build(&self, settings: CollectorSettings) -> Result<Self::Service, ServiceError>;
}
