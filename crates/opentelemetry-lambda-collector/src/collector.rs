//! Lifecycle coordinator for the collector service.
//!
//! [`Collector`] builds a service through a [`ServiceFactory`], runs it on a
//! dedicated tokio task and exposes a ready / failed contract to the caller:
//!
//! - [`Collector::start`] returns once the service reports
//!   [`ServiceState::Running`], or with an error if the service fails to
//!   build, exits, or does not become ready within the startup timeout.
//! - [`Collector::stop`] requests shutdown exactly once and waits for the
//!   service task to return.
//!
//! The task's [`JoinHandle`] is the completion signal. It resolves only after
//! the run future has fully returned, and carries the run's result. Service
//! state travels through a `watch` channel, so readiness and failure are
//! never read from shared mutable memory.

use crate::service::{
    CollectorService, CollectorSettings, ServiceError, ServiceFactory, ServiceState,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Default bound on [`Collector::start`].
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

type RunResult = Result<(), ServiceError>;

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// `start` has not been called.
    NotStarted,
    /// Waiting for the service to become ready.
    Starting,
    /// The service reported ready.
    Running,
    /// Shutdown requested, waiting for the service task.
    Stopping,
    /// The service task returned cleanly after shutdown.
    Stopped,
    /// Build, startup or run failure.
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors from the lifecycle coordinator.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// The factory could not build the service.
    #[error("failed to build collector service")]
    Build(#[source] ServiceError),

    /// The service run returned an error.
    #[error("collector service failed")]
    Run(#[source] ServiceError),

    /// The service run returned successfully before becoming ready.
    #[error("collector service exited before becoming ready")]
    ExitedEarly,

    /// The service reported a state other than starting or running during
    /// startup and then exited without an error.
    #[error("collector service entered unexpected state {0} during startup")]
    UnexpectedState(ServiceState),

    /// The service did not become ready in time.
    #[error("collector service did not become ready within {0:?}")]
    StartTimeout(Duration),

    /// `start` was called more than once.
    #[error("collector has already been started")]
    AlreadyStarted,

    /// The service task panicked.
    #[error("collector service task panicked")]
    Panicked(#[source] JoinError),
}

enum Completion {
    /// No task has been spawned.
    Idle,
    /// The task is running or its result has not been collected.
    Pending(JoinHandle<RunResult>),
    /// The result has been collected, or nothing ever ran.
    Done,
}

enum Startup {
    Ready,
    Exited(Result<RunResult, JoinError>),
    Terminal(ServiceState, Result<RunResult, JoinError>),
}

/// Runs a collector service on its own task and coordinates its lifecycle.
///
/// `start` and `stop` take `&mut self`, so lifecycle calls are serialised by
/// the borrow checker.
pub struct Collector<F: ServiceFactory> {
    factory: F,
    settings: CollectorSettings,
    startup_timeout: Duration,
    state: LifecycleState,
    service: Option<Arc<F::Service>>,
    completion: Completion,
    stopped: bool,
}

impl<F: ServiceFactory> Collector<F> {
    /// Creates a coordinator that will build its service from `factory`.
    pub fn new(factory: F, settings: CollectorSettings) -> Self {
        Self {
            factory,
            settings,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            state: LifecycleState::NotStarted,
            service: None,
            completion: Completion::Idle,
            stopped: false,
        }
    }

    /// Sets the bound on [`start`](Self::start).
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Current lifecycle state.
    ///
    /// Reports [`LifecycleState::Failed`] once a running service's task has
    /// exited without a stop request.
    pub fn state(&self) -> LifecycleState {
        match (&self.completion, self.state) {
            (Completion::Pending(handle), LifecycleState::Running) if handle.is_finished() => {
                LifecycleState::Failed
            }
            (_, state) => state,
        }
    }

    /// The running service, once built.
    pub fn service(&self) -> Option<&Arc<F::Service>> {
        self.service.as_ref()
    }

    /// Builds the service, starts it and waits until it is ready.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::Build`] if the factory fails; nothing runs
    /// - [`CollectorError::Run`] or [`CollectorError::ExitedEarly`] if the
    ///   service exits before becoming ready
    /// - [`CollectorError::UnexpectedState`] if it reports a terminal state
    ///   instead of becoming ready
    /// - [`CollectorError::StartTimeout`] if it is not ready in time; the
    ///   service keeps running until [`stop`](Self::stop)
    /// - [`CollectorError::AlreadyStarted`] on a second call
    pub async fn start(&mut self) -> Result<(), CollectorError> {
        if self.state != LifecycleState::NotStarted {
            return Err(CollectorError::AlreadyStarted);
        }
        self.state = LifecycleState::Starting;

        tracing::info!(build = %self.settings.build_info, "Starting collector");

        let service = match self.factory.build(self.settings.clone()) {
            Ok(service) => Arc::new(service),
            Err(e) => {
                tracing::error!(error = %e, "Failed to build collector service");
                self.state = LifecycleState::Failed;
                self.completion = Completion::Done;
                return Err(CollectorError::Build(e));
            }
        };

        let mut state_rx = service.state();
        let mut handle = tokio::spawn(Arc::clone(&service).run());
        self.service = Some(service);

        let startup = tokio::time::timeout(
            self.startup_timeout,
            wait_until_ready(&mut handle, &mut state_rx),
        )
        .await;

        let error = match startup {
            Ok(Startup::Ready) => {
                self.completion = Completion::Pending(handle);
                self.state = LifecycleState::Running;
                tracing::info!("Collector is running");
                return Ok(());
            }
            Ok(Startup::Exited(joined)) => {
                self.completion = Completion::Done;
                match joined {
                    Ok(Ok(())) => CollectorError::ExitedEarly,
                    Ok(Err(e)) => CollectorError::Run(e),
                    Err(e) => CollectorError::Panicked(e),
                }
            }
            Ok(Startup::Terminal(state, joined)) => {
                self.completion = Completion::Done;
                match joined {
                    Ok(Ok(())) => CollectorError::UnexpectedState(state),
                    Ok(Err(e)) => CollectorError::Run(e),
                    Err(e) => CollectorError::Panicked(e),
                }
            }
            Err(_) => {
                self.completion = Completion::Pending(handle);
                CollectorError::StartTimeout(self.startup_timeout)
            }
        };

        tracing::error!(error = %error, "Collector failed to start");
        self.state = LifecycleState::Failed;
        Err(error)
    }

    /// Requests shutdown and waits for the service task to return.
    ///
    /// The first call issues the shutdown request; later calls only wait. A
    /// run failure not yet reported by [`start`](Self::start) is returned by
    /// the first call that observes it. Calling `stop` before `start` does
    /// nothing.
    ///
    /// There is no timeout; callers needing a deadline must impose one.
    ///
    /// # Errors
    ///
    /// [`CollectorError::Run`] or [`CollectorError::Panicked`] if the service
    /// task ended badly.
    pub async fn stop(&mut self) -> Result<(), CollectorError> {
        let Some(service) = self.service.as_ref() else {
            return Ok(());
        };

        if !self.stopped {
            self.stopped = true;
            if self.state == LifecycleState::Running {
                self.state = LifecycleState::Stopping;
            }
            tracing::info!("Stopping collector");
            service.shutdown();
        }

        let Completion::Pending(handle) = &mut self.completion else {
            return Ok(());
        };
        let joined = handle.await;
        self.completion = Completion::Done;

        match joined {
            Ok(Ok(())) => {
                if self.state == LifecycleState::Stopping {
                    self.state = LifecycleState::Stopped;
                }
                tracing::info!("Collector stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Collector service failed");
                self.state = LifecycleState::Failed;
                Err(CollectorError::Run(e))
            }
            Err(e) => {
                self.state = LifecycleState::Failed;
                Err(CollectorError::Panicked(e))
            }
        }
    }
}

impl<F: ServiceFactory> Drop for Collector<F> {
    fn drop(&mut self) {
        if !self.stopped
            && let Some(service) = &self.service
        {
            service.shutdown();
        }
    }
}

impl<F: ServiceFactory> fmt::Debug for Collector<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("state", &self.state())
            .field("startup_timeout", &self.startup_timeout)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

/// Waits for readiness or termination. The completion signal always wins a
/// tie, so readiness is never reported once a result is available.
async fn wait_until_ready(
    handle: &mut JoinHandle<RunResult>,
    state_rx: &mut watch::Receiver<ServiceState>,
) -> Startup {
    loop {
        let current = *state_rx.borrow_and_update();

        if handle.is_finished() {
            return Startup::Exited(handle.await);
        }

        match current {
            ServiceState::Running => return Startup::Ready,
            ServiceState::Starting => {}
            terminal => return Startup::Terminal(terminal, handle.await),
        }

        tokio::select! {
            biased;
            joined = &mut *handle => return Startup::Exited(joined),
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Startup::Exited(handle.await);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_info::BuildInfo;
    use crate::confmap::Conf;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, Copy)]
    enum Script {
        /// Ready, then runs until shutdown.
        Ready,
        /// Returns an error without becoming ready.
        FailImmediately,
        /// Reports ready and fails in the same step.
        ReadyThenFail,
        /// Never becomes ready.
        Hang,
        /// Reports closed and exits cleanly without becoming ready.
        CloseImmediately,
        /// Ready, then fails shortly afterwards without a stop request.
        FailAfterReady,
        /// Ready, then fails while shutting down.
        FailOnShutdown,
    }

    struct FakeService {
        script: Script,
        state_tx: watch::Sender<ServiceState>,
        cancel: CancellationToken,
        shutdowns: Arc<AtomicUsize>,
    }

    impl CollectorService for FakeService {
        fn run(self: Arc<Self>) -> impl Future<Output = RunResult> + Send {
            async move {
                match self.script {
                    Script::Ready => {
                        self.state_tx.send_replace(ServiceState::Running);
                        self.cancel.cancelled().await;
                        self.state_tx.send_replace(ServiceState::Closed);
                        Ok(())
                    }
                    Script::FailImmediately => Err("listener exploded".into()),
                    Script::ReadyThenFail => {
                        self.state_tx.send_replace(ServiceState::Running);
                        Err("failed right after start".into())
                    }
                    Script::Hang => {
                        self.cancel.cancelled().await;
                        self.state_tx.send_replace(ServiceState::Closed);
                        Ok(())
                    }
                    Script::CloseImmediately => {
                        self.state_tx.send_replace(ServiceState::Closed);
                        Ok(())
                    }
                    Script::FailAfterReady => {
                        self.state_tx.send_replace(ServiceState::Running);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        self.state_tx.send_replace(ServiceState::Failed);
                        Err("pipeline crashed".into())
                    }
                    Script::FailOnShutdown => {
                        self.state_tx.send_replace(ServiceState::Running);
                        self.cancel.cancelled().await;
                        self.state_tx.send_replace(ServiceState::Failed);
                        Err("flush failed".into())
                    }
                }
            }
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
        }

        fn state(&self) -> watch::Receiver<ServiceState> {
            self.state_tx.subscribe()
        }
    }

    struct FakeFactory {
        script: Script,
        fail_build: bool,
        builds: AtomicUsize,
        shutdowns: Arc<AtomicUsize>,
    }

    impl FakeFactory {
        fn new(script: Script) -> Self {
            Self {
                script,
                fail_build: false,
                builds: AtomicUsize::new(0),
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing() -> Self {
            Self {
                fail_build: true,
                ..Self::new(Script::Ready)
            }
        }
    }

    impl ServiceFactory for FakeFactory {
        type Service = FakeService;

        fn build(&self, _settings: CollectorSettings) -> Result<FakeService, ServiceError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail_build {
                return Err("unknown receiver type".into());
            }
            let (state_tx, _) = watch::channel(ServiceState::Starting);
            Ok(FakeService {
                script: self.script,
                state_tx,
                cancel: CancellationToken::new(),
                shutdowns: Arc::clone(&self.shutdowns),
            })
        }
    }

    fn collector(factory: FakeFactory) -> (Collector<FakeFactory>, Arc<AtomicUsize>) {
        let shutdowns = Arc::clone(&factory.shutdowns);
        let settings = CollectorSettings {
            build_info: BuildInfo::new("0.0.0-test"),
            config: Conf::new(),
        };
        (Collector::new(factory, settings), shutdowns)
    }

    #[tokio::test]
    async fn test_start_reports_ready() {
        let (mut collector, shutdowns) = collector(FakeFactory::new(Script::Ready));

        collector.start().await.unwrap();
        assert_eq!(collector.state(), LifecycleState::Running);

        collector.stop().await.unwrap();
        assert_eq!(collector.state(), LifecycleState::Stopped);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_failure() {
        let (mut collector, shutdowns) = collector(FakeFactory::failing());

        let err = collector.start().await.unwrap_err();
        assert!(matches!(err, CollectorError::Build(_)));
        assert_eq!(collector.state(), LifecycleState::Failed);
        assert!(collector.service().is_none());

        tokio::time::timeout(Duration::from_millis(100), collector.stop())
            .await
            .expect("stop must return immediately after a build failure")
            .unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_early_run_failure() {
        let (mut collector, _) = collector(FakeFactory::new(Script::FailImmediately));

        let err = collector.start().await.unwrap_err();
        match err {
            CollectorError::Run(source) => assert_eq!(source.to_string(), "listener exploded"),
            other => panic!("Expected Run, got {:?}", other),
        }
        assert_eq!(collector.state(), LifecycleState::Failed);

        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_never_ready_after_failure() {
        let (mut collector, _) = collector(FakeFactory::new(Script::ReadyThenFail));

        let err = collector.start().await.unwrap_err();
        assert!(matches!(err, CollectorError::Run(_)));
        assert_eq!(collector.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_unexpected_state() {
        let (mut collector, _) = collector(FakeFactory::new(Script::CloseImmediately));

        let err = collector.start().await.unwrap_err();
        assert!(matches!(
            err,
            CollectorError::ExitedEarly | CollectorError::UnexpectedState(ServiceState::Closed)
        ));
        assert_eq!(collector.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_start_timeout() {
        let (collector, shutdowns) = collector(FakeFactory::new(Script::Hang));
        let mut collector = collector.with_startup_timeout(Duration::from_millis(50));

        let err = collector.start().await.unwrap_err();
        assert!(matches!(err, CollectorError::StartTimeout(_)));
        assert_eq!(collector.state(), LifecycleState::Failed);

        collector.stop().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (mut collector, _) = collector(FakeFactory::new(Script::Ready));

        collector.start().await.unwrap();
        assert!(matches!(
            collector.start().await,
            Err(CollectorError::AlreadyStarted)
        ));

        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_stop_shuts_down_once() {
        let (mut collector, shutdowns) = collector(FakeFactory::new(Script::Ready));
        collector.start().await.unwrap();

        collector.stop().await.unwrap();
        collector.stop().await.unwrap();

        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(collector.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (mut collector, shutdowns) = collector(FakeFactory::new(Script::Ready));

        collector.stop().await.unwrap();

        assert_eq!(collector.state(), LifecycleState::NotStarted);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_late_failure_reported_by_stop_once() {
        let (mut collector, _) = collector(FakeFactory::new(Script::FailOnShutdown));
        collector.start().await.unwrap();

        let err = collector.stop().await.unwrap_err();
        assert!(matches!(err, CollectorError::Run(_)));
        assert_eq!(collector.state(), LifecycleState::Failed);

        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_after_ready_marks_failed() {
        let (mut collector, _) = collector(FakeFactory::new(Script::FailAfterReady));
        collector.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while collector.state() != LifecycleState::Failed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("service task should exit");

        assert!(matches!(
            collector.stop().await,
            Err(CollectorError::Run(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_requests_shutdown() {
        let (mut collector, shutdowns) = collector(FakeFactory::new(Script::Ready));
        collector.start().await.unwrap();

        drop(collector);

        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_start_does_not_rebuild() {
        let (mut collector, _) = collector(FakeFactory::failing());

        assert!(collector.start().await.is_err());
        assert!(matches!(
            collector.start().await,
            Err(CollectorError::AlreadyStarted)
        ));

        assert_eq!(collector.factory.builds.load(Ordering::SeqCst), 1);
    }
}
