//! Collector configuration resolution.
//!
//! A [`ConfigResolver`] turns an ordered list of source URIs into one merged
//! [`Conf`]. Each URI is routed to the [`Provider`] registered for its scheme,
//! the retrieved YAML documents are deep-merged in order (later sources win),
//! and the [`Converter`]s are applied to the merged tree.
//!
//! Keys may use `::` to address nested maps, so
//! `yaml:processors::batch::timeout: 2s` sets `processors.batch.timeout`.

mod converter;
mod provider;

pub use converter::{Converter, DisableQueuedRetryConverter, ExpandConverter};
pub use provider::{
    EnvProvider, FileProvider, HttpProvider, Provider, RetrieveFuture, S3Provider, YamlProvider,
};

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;

/// Delimiter between nested keys.
pub const KEY_DELIMITER: &str = "::";

/// Errors from configuration resolution.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No source URIs were given.
    #[error("no configuration URIs provided")]
    NoUris,

    /// No provider is registered for the URI's scheme.
    #[error("unsupported scheme {scheme:?} in configuration URI {uri}")]
    UnsupportedScheme {
        /// Offending URI.
        uri: String,
        /// Its scheme.
        scheme: String,
    },

    /// The URI is malformed for its scheme.
    #[error("invalid configuration URI {uri}: {reason}")]
    InvalidUri {
        /// Offending URI.
        uri: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An `env:` source names an unset variable.
    #[error("environment variable {variable} referenced by {uri} is not set")]
    EnvNotFound {
        /// Source URI.
        uri: String,
        /// Variable name.
        variable: String,
    },

    /// A file source could not be read.
    #[error("failed to read configuration from {uri}")]
    Io {
        /// Source URI.
        uri: String,
        /// Read error.
        #[source]
        source: std::io::Error,
    },

    /// A source is not valid YAML.
    #[error("failed to parse configuration from {uri}")]
    Yaml {
        /// Source URI.
        uri: String,
        /// Parse error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A source parsed, but its top level is not a map.
    #[error("configuration from {uri} is not a map")]
    NotAMap {
        /// Source URI.
        uri: String,
    },

    /// An HTTP source could not be fetched.
    #[error("failed to fetch configuration from {uri}")]
    Http {
        /// Source URI.
        uri: String,
        /// Transport error.
        #[source]
        source: reqwest::Error,
    },

    /// An HTTP source answered with a non-success status.
    #[error("fetching configuration from {uri} returned status {status}")]
    HttpStatus {
        /// Source URI.
        uri: String,
        /// Response status.
        status: u16,
    },

    /// An S3 source could not be fetched.
    #[error("failed to fetch configuration from {uri}")]
    S3 {
        /// Source URI.
        uri: String,
        /// Underlying SDK error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A converter rejected the merged configuration.
    #[error("converter {name} failed: {message}")]
    Converter {
        /// Converter name.
        name: &'static str,
        /// Failure description.
        message: String,
    },
}

/// A resolved configuration tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conf {
    root: Mapping,
}

impl Conf {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML document retrieved from `uri`.
    ///
    /// An empty document yields an empty configuration.
    pub fn from_yaml(uri: &str, yaml: &str) -> Result<Self, ResolveError> {
        let value: Value = serde_yaml::from_str(yaml).map_err(|source| ResolveError::Yaml {
            uri: uri.to_string(),
            source,
        })?;

        match expand_keys(value) {
            Value::Null => Ok(Self::new()),
            Value::Mapping(root) => Ok(Self { root }),
            _ => Err(ResolveError::NotAMap {
                uri: uri.to_string(),
            }),
        }
    }

    /// Whether the configuration has no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Returns the underlying map.
    pub fn as_mapping(&self) -> &Mapping {
        &self.root
    }

    /// Returns the underlying map mutably.
    pub fn as_mapping_mut(&mut self) -> &mut Mapping {
        &mut self.root
    }

    /// Looks up a `::`-delimited path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split(KEY_DELIMITER);
        let first = segments.next()?;
        let mut current = self.root.get(first)?;

        for segment in segments {
            current = current.as_mapping()?.get(segment)?;
        }

        Some(current)
    }

    /// Sets a `::`-delimited path, creating intermediate maps as needed.
    ///
    /// A non-map value on the way is replaced by a map.
    pub fn set(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split(KEY_DELIMITER).collect();
        set_path(&mut self.root, &segments, value);
    }

    /// Deep-merges `other` into `self`; values from `other` win.
    pub fn merge(&mut self, other: Conf) {
        merge_mappings(&mut self.root, other.root);
    }

    /// Deserialises the value at `path` into `T`.
    ///
    /// Returns `Ok(None)` when the path is absent.
    pub fn extract<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, serde_yaml::Error> {
        self.get(path)
            .map(|value| serde_yaml::from_value(value.clone()))
            .transpose()
    }
}

fn set_path(map: &mut Mapping, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert(Value::String((*last).to_string()), value);
        }
        [first, rest @ ..] => {
            let entry = map
                .entry(Value::String((*first).to_string()))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if !entry.is_mapping() {
                *entry = Value::Mapping(Mapping::new());
            }
            if let Value::Mapping(next) = entry {
                set_path(next, rest, value);
            }
        }
    }
}

fn merge_mappings(target: &mut Mapping, source: Mapping) {
    for (key, value) in source {
        match value {
            Value::Mapping(incoming) => {
                if let Some(Value::Mapping(existing)) = target.get_mut(&key) {
                    merge_mappings(existing, incoming);
                } else {
                    target.insert(key, Value::Mapping(incoming));
                }
            }
            value => {
                target.insert(key, value);
            }
        }
    }
}

fn expand_keys(value: Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut expanded = Mapping::new();
            for (key, value) in mapping {
                let value = expand_keys(value);
                let nested = match key.as_str() {
                    Some(path) if path.contains(KEY_DELIMITER) => {
                        let mut conf = Conf::new();
                        conf.set(path, value);
                        conf.root
                    }
                    _ => Mapping::from_iter([(key, value)]),
                };
                merge_mappings(&mut expanded, nested);
            }
            Value::Mapping(expanded)
        }
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(expand_keys).collect()),
        other => other,
    }
}

/// Resolves configuration from an ordered list of source URIs.
pub struct ConfigResolver {
    uris: Vec<String>,
    providers: HashMap<&'static str, Box<dyn Provider>>,
    converters: Vec<Box<dyn Converter>>,
}

impl ConfigResolver {
    /// Creates a resolver with the standard providers (`file`, `env`, `yaml`,
    /// `http`, `https`, `s3`) and converters (env expansion, then disabling
    /// exporter queues and retries).
    pub fn new<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::empty(uris)
            .with_provider(FileProvider)
            .with_provider(EnvProvider)
            .with_provider(YamlProvider)
            .with_provider(HttpProvider::http())
            .with_provider(HttpProvider::https())
            .with_provider(S3Provider)
            .with_converter(ExpandConverter)
            .with_converter(DisableQueuedRetryConverter)
    }

    /// Creates a resolver with no providers or converters.
    pub fn empty<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uris: uris.into_iter().map(Into::into).collect(),
            providers: HashMap::new(),
            converters: Vec::new(),
        }
    }

    /// Registers a provider, replacing any provider with the same scheme.
    pub fn with_provider(mut self, provider: impl Provider + 'static) -> Self {
        self.providers.insert(provider.scheme(), Box::new(provider));
        self
    }

    /// Appends a converter.
    pub fn with_converter(mut self, converter: impl Converter + 'static) -> Self {
        self.converters.push(Box::new(converter));
        self
    }

    /// Source URIs in resolution order.
    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<_> = self.providers.keys().copied().collect();
        schemes.sort_unstable();
        schemes
    }

    /// Retrieves, merges and converts all sources.
    ///
    /// # Errors
    ///
    /// Fails on the first source that cannot be retrieved or parsed, or on the
    /// first converter error. There is no partial result.
    pub async fn resolve(&self) -> Result<Conf, ResolveError> {
        if self.uris.is_empty() {
            return Err(ResolveError::NoUris);
        }

        let mut conf = Conf::new();

        for uri in &self.uris {
            let scheme = scheme_of(uri);
            let provider =
                self.providers
                    .get(scheme)
                    .ok_or_else(|| ResolveError::UnsupportedScheme {
                        uri: uri.clone(),
                        scheme: scheme.to_string(),
                    })?;

            tracing::debug!(%uri, scheme, "Retrieving configuration source");
            let yaml = provider.retrieve(uri).await?;
            conf.merge(Conf::from_yaml(uri, &yaml)?);
        }

        for converter in &self.converters {
            tracing::debug!(converter = converter.name(), "Applying configuration converter");
            converter.convert(&mut conf)?;
        }

        Ok(conf)
    }
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver")
            .field("uris", &self.uris)
            .field("schemes", &self.schemes())
            .field(
                "converters",
                &self.converters.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Returns the scheme of a configuration URI. URIs without a scheme are file
/// paths.
pub(crate) fn scheme_of(uri: &str) -> &str {
    match uri.split_once(':') {
        Some((scheme, _)) if is_scheme(scheme) => scheme,
        _ => "file",
    }
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && candidate.len() > 1
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
