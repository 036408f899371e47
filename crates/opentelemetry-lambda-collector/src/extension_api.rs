//! Lambda Extensions API client.
//!
//! Registers the extension for `INVOKE` and `SHUTDOWN` events and long-polls
//! for the next lifecycle event.

use crate::telemetry_api::EXTENSION_IDENTIFIER_HEADER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

/// Extensions API version path segment.
pub const EXTENSIONS_API_VERSION: &str = "2020-01-01";

/// Header carrying the extension name at registration.
pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";

/// Errors from the Extensions API client.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ExtensionApiError {
    /// The request never got a response.
    #[error("request to {endpoint} failed")]
    Http {
        /// Request URL.
        endpoint: String,
        /// Transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Lambda answered with a non-success status.
    #[error("request to {endpoint} failed: {status} {body}")]
    Status {
        /// Request URL.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Registration succeeded but no identifier header came back.
    #[error("registration response is missing the Lambda-Extension-Identifier header")]
    MissingIdentifier,

    /// `next_event` was called before `register`.
    #[error("extension is not registered")]
    NotRegistered,

    /// The response body is not the expected JSON.
    #[error("failed to decode response from {endpoint}")]
    Decode {
        /// Request URL.
        endpoint: String,
        /// Decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Events the extension registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// Function invocation.
    Invoke,
    /// Execution environment shutdown.
    Shutdown,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    events: &'a [EventType],
}

/// Registration result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Registration {
    /// Identifier issued by Lambda, sent with every later request.
    #[serde(skip)]
    pub extension_id: String,
    /// Function name.
    pub function_name: Option<String>,
    /// Function version.
    pub function_version: Option<String>,
    /// Function handler.
    pub handler: Option<String>,
}

/// Why the execution environment is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownReason {
    /// Idle environment reclaimed.
    Spindown,
    /// Invocation timed out.
    Timeout,
    /// Runtime or extension failure.
    Failure,
    /// A reason this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Lifecycle event returned by `event/next`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "eventType", rename_all = "UPPERCASE")]
pub enum NextEvent {
    /// A function invocation started.
    #[serde(rename_all = "camelCase")]
    Invoke {
        /// Invocation deadline, epoch milliseconds.
        #[serde(default)]
        deadline_ms: u64,
        /// Invocation request ID.
        #[serde(default)]
        request_id: String,
        /// ARN of the invoked function.
        #[serde(default)]
        invoked_function_arn: String,
    },
    /// The environment is shutting down.
    #[serde(rename_all = "camelCase")]
    Shutdown {
        /// Shutdown reason.
        shutdown_reason: ShutdownReason,
        /// Shutdown deadline, epoch milliseconds.
        #[serde(default)]
        deadline_ms: u64,
    },
}

impl NextEvent {
    /// Whether this is a shutdown event.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }
}

/// Client for the Lambda Extensions API.
#[derive(Debug, Clone)]
pub struct ExtensionApiClient {
    client: Client,
    base_url: String,
    extension_id: Option<String>,
}

impl ExtensionApiClient {
    /// Creates a client for the given Runtime API base URL.
    ///
    /// `event/next` is a long poll, so the client has no request timeout.
    pub fn new(runtime_api_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: format!(
                "{}/{}/extension",
                runtime_api_url.trim_end_matches('/'),
                EXTENSIONS_API_VERSION
            ),
            extension_id: None,
        }
    }

    /// Identifier issued at registration.
    pub fn extension_id(&self) -> Option<&str> {
        self.extension_id.as_deref()
    }

    /// Registers the extension for `INVOKE` and `SHUTDOWN` events.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-200 responses, or a missing
    /// identifier header.
    pub async fn register(&mut self, name: &str) -> Result<Registration, ExtensionApiError> {
        let endpoint = format!("{}/register", self.base_url);

        tracing::debug!(%endpoint, name, "Registering extension");

        let response = self
            .client
            .post(&endpoint)
            .header(EXTENSION_NAME_HEADER, name)
            .json(&RegisterRequest {
                events: &[EventType::Invoke, EventType::Shutdown],
            })
            .send()
            .await
            .map_err(|source| ExtensionApiError::Http {
                endpoint: endpoint.clone(),
                source,
            })?;

        let extension_id = response
            .headers()
            .get(EXTENSION_IDENTIFIER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = read_body(&endpoint, response).await?;
        let extension_id = extension_id.ok_or(ExtensionApiError::MissingIdentifier)?;

        let mut registration: Registration = if body.trim().is_empty() {
            Registration::default()
        } else {
            serde_json::from_str(&body).map_err(|source| ExtensionApiError::Decode {
                endpoint: endpoint.clone(),
                source,
            })?
        };
        registration.extension_id = extension_id.clone();
        self.extension_id = Some(extension_id);

        tracing::info!(
            extension_id = %registration.extension_id,
            function_name = ?registration.function_name,
            "Extension registered"
        );
        Ok(registration)
    }

    /// Blocks until Lambda delivers the next lifecycle event.
    ///
    /// # Errors
    ///
    /// Fails if the extension is not registered, on transport errors,
    /// non-200 responses, or an undecodable event.
    pub async fn next_event(&self) -> Result<NextEvent, ExtensionApiError> {
        let extension_id = self
            .extension_id
            .as_deref()
            .ok_or(ExtensionApiError::NotRegistered)?;
        let endpoint = format!("{}/event/next", self.base_url);

        let response = self
            .client
            .get(&endpoint)
            .header(EXTENSION_IDENTIFIER_HEADER, extension_id)
            .send()
            .await
            .map_err(|source| ExtensionApiError::Http {
                endpoint: endpoint.clone(),
                source,
            })?;

        let body = read_body(&endpoint, response).await?;
        let event = serde_json::from_str(&body)
            .map_err(|source| ExtensionApiError::Decode { endpoint, source })?;

        tracing::debug!(?event, "Received lifecycle event");
        Ok(event)
    }
}

async fn read_body(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<String, ExtensionApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| ExtensionApiError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;

    if status != StatusCode::OK {
        return Err(ExtensionApiError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    Ok(body)
}
