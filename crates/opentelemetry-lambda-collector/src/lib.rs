//! AWS Lambda extension that runs a telemetry collector.
//!
//! The extension registers with the Lambda Extensions API, resolves the
//! collector configuration from an ordered list of sources, starts the
//! collector's telemetry receiver, and subscribes that receiver to the Lambda
//! Telemetry API. It runs until Lambda sends `SHUTDOWN` or the process is
//! signalled, then stops the collector once.
//!
//! The main building blocks can be used on their own:
//!
//! - [`TelemetryApiClient`] performs the Telemetry API subscription
//! - [`Collector`] runs any [`CollectorService`] on its own task with a
//!   ready / failed / stopped contract
//! - [`ConfigResolver`] merges YAML configuration from `file:`, `env:`,
//!   `yaml:`, `http(s)://` and `s3://` sources

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod build_info;
pub mod collector;
pub mod config;
pub mod confmap;
pub mod extension_api;
pub mod receiver;
pub mod runtime;
pub mod service;
pub mod telemetry;
pub mod telemetry_api;

pub use build_info::BuildInfo;
pub use collector::{Collector, CollectorError, LifecycleState};
pub use config::{CollectorConfig, Config, ConfigBuilder, ExtensionConfig, TelemetryApiConfig};
pub use confmap::{Conf, ConfigResolver, Converter, Provider, ResolveError};
pub use extension_api::{ExtensionApiClient, ExtensionApiError, NextEvent, Registration};
pub use receiver::{ReceiverConfig, ReceiverFactory, ReceiverService, TelemetryBatch};
pub use runtime::{ExtensionRuntime, RuntimeError};
pub use service::{CollectorService, CollectorSettings, ServiceError, ServiceFactory, ServiceState};
pub use telemetry::{
    BufferingConfig, Destination, SubscriptionRequest, TelemetryEvent, TelemetryType,
};
pub use telemetry_api::{TelemetryApiClient, TelemetryApiError};
