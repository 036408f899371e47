//! Telemetry API subscription client.
//!
//! Performs the single `PUT /2022-07-01/telemetry` exchange that tells Lambda
//! where to push telemetry batches. There is no retry: a transport failure or
//! an unexpected status is reported to the caller immediately.
//!
//! Calling [`TelemetryApiClient::subscribe`] again with the same extension
//! identifier is allowed. Lambda is assumed to keep the last subscription.

use crate::config::TelemetryApiConfig;
use crate::telemetry::{
    BufferingConfig, SCHEMA_VERSION_LATEST, SubscriptionRequest, TelemetryType,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};

/// Header carrying the identifier issued at extension registration.
pub const EXTENSION_IDENTIFIER_HEADER: &str = "Lambda-Extension-Identifier";

/// Errors from the Telemetry API client.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TelemetryApiError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    /// The subscription request could not be serialised.
    #[error("failed to serialise subscription request")]
    Serialize(#[source] serde_json::Error),

    /// The buffering thresholds are outside what Lambda accepts.
    #[error("invalid buffering configuration: {0}")]
    InvalidBuffering(String),

    /// The request never got a response.
    #[error("request to {endpoint} failed")]
    Http {
        /// Subscription endpoint.
        endpoint: String,
        /// Transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The response body could not be read.
    #[error("request to {endpoint} failed: {status}[{status_text}]")]
    Body {
        /// Subscription endpoint.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Status line, e.g. `400 Bad Request`.
        status_text: String,
        /// Read error.
        #[source]
        source: reqwest::Error,
    },

    /// Lambda rejected the subscription.
    #[error("request to {endpoint} failed: {status}[{status_text}] {body}")]
    Status {
        /// Subscription endpoint.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Status line, e.g. `400 Bad Request`.
        status_text: String,
        /// Response body.
        body: String,
    },

    /// Lambda answered `202 Accepted`: the Telemetry API is not available in
    /// this environment and no telemetry will be delivered.
    #[error("Telemetry API is not supported at {endpoint}; running in a local sandbox?")]
    NotSupported {
        /// Subscription endpoint.
        endpoint: String,
    },
}

/// Client for the Lambda Telemetry API.
#[derive(Debug, Clone)]
pub struct TelemetryApiClient {
    client: Client,
    endpoint: String,
    types: Vec<TelemetryType>,
    buffering: BufferingConfig,
}

impl TelemetryApiClient {
    /// Creates a client for the given Runtime API base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        runtime_api_url: &str,
        config: &TelemetryApiConfig,
    ) -> Result<Self, TelemetryApiError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(TelemetryApiError::Client)?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/{}/telemetry",
                runtime_api_url.trim_end_matches('/'),
                SCHEMA_VERSION_LATEST
            ),
            types: config.types.clone(),
            buffering: BufferingConfig::default(),
        })
    }

    /// Overrides the buffering thresholds sent with each subscription.
    pub fn with_buffering(mut self, buffering: BufferingConfig) -> Self {
        self.buffering = buffering;
        self
    }

    /// Returns the subscription endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Subscribes the extension to the configured telemetry types.
    ///
    /// On `200 OK` the response body is returned verbatim.
    ///
    /// # Errors
    ///
    /// - [`TelemetryApiError::NotSupported`] on `202 Accepted`
    /// - [`TelemetryApiError::Status`] on any other non-200 status, carrying
    ///   the status and body
    /// - [`TelemetryApiError::Http`] if the request fails in transit
    pub async fn subscribe(
        &self,
        extension_id: &str,
        listener_uri: &str,
    ) -> Result<String, TelemetryApiError> {
        let request = SubscriptionRequest::new(self.types.clone(), listener_uri)
            .with_buffering(self.buffering);
        request
            .buffering
            .validate()
            .map_err(TelemetryApiError::InvalidBuffering)?;
        let body = serde_json::to_vec(&request).map_err(TelemetryApiError::Serialize)?;

        tracing::info!(
            endpoint = %self.endpoint,
            types = ?request.types,
            destination = %listener_uri,
            "Subscribing to Telemetry API"
        );

        let response = self
            .client
            .put(&self.endpoint)
            .header(EXTENSION_IDENTIFIER_HEADER, extension_id)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|source| {
                tracing::error!(error = %source, "Telemetry API subscription failed");
                TelemetryApiError::Http {
                    endpoint: self.endpoint.clone(),
                    source,
                }
            })?;

        let status = response.status();

        if status == StatusCode::ACCEPTED {
            tracing::warn!(
                status_code = status.as_u16(),
                "Telemetry API is not supported, is this extension running in a local sandbox?"
            );
            return Err(TelemetryApiError::NotSupported {
                endpoint: self.endpoint.clone(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| TelemetryApiError::Body {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                status_text: status.to_string(),
                source,
            })?;

        if status != StatusCode::OK {
            tracing::error!(
                status_code = status.as_u16(),
                %body,
                "Telemetry API subscription failed"
            );
            return Err(TelemetryApiError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                status_text: status.to_string(),
                body,
            });
        }

        tracing::info!(response = %body, "Telemetry API subscription succeeded");
        Ok(body)
    }
}
