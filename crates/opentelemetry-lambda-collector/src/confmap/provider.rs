//! Configuration source providers, one per URI scheme.

use super::ResolveError;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use std::future::Future;
use std::pin::Pin;

/// Future returned by [`Provider::retrieve`].
pub type RetrieveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, ResolveError>> + Send + 'a>>;

/// Retrieves the raw YAML document behind a configuration URI.
pub trait Provider: Send + Sync {
    /// The URI scheme this provider serves.
    fn scheme(&self) -> &'static str;

    /// Retrieves the document for `uri` (including its scheme).
    fn retrieve<'a>(&'a self, uri: &'a str) -> RetrieveFuture<'a>;
}

fn strip_scheme<'a>(uri: &'a str, scheme: &str) -> &'a str {
    uri.strip_prefix(scheme)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(uri)
}

/// `file:<path>`, or a bare path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProvider;

impl Provider for FileProvider {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn retrieve<'a>(&'a self, uri: &'a str) -> RetrieveFuture<'a> {
        Box::pin(async move {
            let path = strip_scheme(uri, "file");
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ResolveError::Io {
                    uri: uri.to_string(),
                    source,
                })
        })
    }
}

/// `env:<VAR>`: YAML held in an environment variable.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProvider;

impl Provider for EnvProvider {
    fn scheme(&self) -> &'static str {
        "env"
    }

    fn retrieve<'a>(&'a self, uri: &'a str) -> RetrieveFuture<'a> {
        Box::pin(async move {
            let name = strip_scheme(uri, "env");
            if name.is_empty() {
                return Err(ResolveError::InvalidUri {
                    uri: uri.to_string(),
                    reason: "missing environment variable name".to_string(),
                });
            }

            std::env::var(name).map_err(|_| ResolveError::EnvNotFound {
                uri: uri.to_string(),
                variable: name.to_string(),
            })
        })
    }
}

/// `yaml:<document>`: inline YAML.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlProvider;

impl Provider for YamlProvider {
    fn scheme(&self) -> &'static str {
        "yaml"
    }

    fn retrieve<'a>(&'a self, uri: &'a str) -> RetrieveFuture<'a> {
        Box::pin(async move { Ok(strip_scheme(uri, "yaml").to_string()) })
    }
}

/// `http://` and `https://` sources fetched with a GET.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    scheme: &'static str,
    client: reqwest::Client,
}

impl HttpProvider {
    /// Provider for `http://` URIs.
    pub fn http() -> Self {
        Self {
            scheme: "http",
            client: reqwest::Client::new(),
        }
    }

    /// Provider for `https://` URIs.
    pub fn https() -> Self {
        Self {
            scheme: "https",
            client: reqwest::Client::new(),
        }
    }
}

impl Provider for HttpProvider {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn retrieve<'a>(&'a self, uri: &'a str) -> RetrieveFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .get(uri)
                .send()
                .await
                .map_err(|source| ResolveError::Http {
                    uri: uri.to_string(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(ResolveError::HttpStatus {
                    uri: uri.to_string(),
                    status: status.as_u16(),
                });
            }

            response.text().await.map_err(|source| ResolveError::Http {
                uri: uri.to_string(),
                source,
            })
        })
    }
}

/// `s3://<bucket>.s3.<region>.amazonaws.com/<key>`, fetched with the
/// function's AWS credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3Provider;

/// Location of an S3 object parsed from a configuration URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct S3Location {
    pub bucket: String,
    pub region: String,
    pub key: String,
}

pub(crate) fn parse_s3_uri(uri: &str) -> Result<S3Location, ResolveError> {
    let invalid = |reason: &str| ResolveError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| invalid("expected s3:// prefix"))?;
    let (host, key) = rest
        .split_once('/')
        .ok_or_else(|| invalid("missing object key"))?;
    let (bucket, region_host) = host
        .split_once(".s3.")
        .ok_or_else(|| invalid("expected <bucket>.s3.<region>.amazonaws.com"))?;
    let region = region_host
        .strip_suffix(".amazonaws.com")
        .ok_or_else(|| invalid("expected <bucket>.s3.<region>.amazonaws.com"))?;

    if bucket.is_empty() || region.is_empty() || key.is_empty() {
        return Err(invalid("bucket, region and key must be non-empty"));
    }

    Ok(S3Location {
        bucket: bucket.to_string(),
        region: region.to_string(),
        key: key.to_string(),
    })
}

impl Provider for S3Provider {
    fn scheme(&self) -> &'static str {
        "s3"
    }

    fn retrieve<'a>(&'a self, uri: &'a str) -> RetrieveFuture<'a> {
        Box::pin(async move {
            let location = parse_s3_uri(uri)?;
            let s3_error = |source: Box<dyn std::error::Error + Send + Sync>| ResolveError::S3 {
                uri: uri.to_string(),
                source,
            };

            let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(location.region.clone()))
                .load()
                .await;
            let client = aws_sdk_s3::Client::new(&sdk_config);

            let output = client
                .get_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .send()
                .await
                .map_err(|e| s3_error(Box::new(e)))?;

            let bytes = output
                .body
                .collect()
                .await
                .map_err(|e| s3_error(Box::new(e)))?
                .into_bytes();

            String::from_utf8(bytes.to_vec()).map_err(|e| s3_error(Box::new(e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_s3_uri() {
        let location =
            parse_s3_uri("s3://my-bucket.s3.eu-west-2.amazonaws.com/collector/config.yaml")
                .unwrap();

        assert_eq!(
            location,
            S3Location {
                bucket: "my-bucket".to_string(),
                region: "eu-west-2".to_string(),
                key: "collector/config.yaml".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_s3_uri_invalid() {
        assert!(parse_s3_uri("s3://my-bucket/config.yaml").is_err());
        assert!(parse_s3_uri("s3://my-bucket.s3.eu-west-2.amazonaws.com").is_err());
        assert!(parse_s3_uri("s3://my-bucket.s3.eu-west-2.amazonaws.com/").is_err());
        assert!(parse_s3_uri("https://my-bucket.s3.eu-west-2.amazonaws.com/a").is_err());
    }

    #[tokio::test]
    async fn test_yaml_provider_strips_scheme() {
        let yaml = YamlProvider.retrieve("yaml:a::b: c").await.unwrap();
        assert_eq!(yaml, "a::b: c");
    }

    #[tokio::test]
    #[serial]
    async fn test_env_provider() {
        let yaml = temp_env::async_with_vars(
            [("COLLECTOR_TEST_CONFIG", Some("receivers: {}"))],
            EnvProvider.retrieve("env:COLLECTOR_TEST_CONFIG"),
        )
        .await
        .unwrap();
        assert_eq!(yaml, "receivers: {}");
    }

    #[tokio::test]
    #[serial]
    async fn test_env_provider_unset_variable() {
        let result = temp_env::async_with_vars(
            [("COLLECTOR_TEST_CONFIG", None::<&str>)],
            EnvProvider.retrieve("env:COLLECTOR_TEST_CONFIG"),
        )
        .await;

        match result {
            Err(ResolveError::EnvNotFound { variable, .. }) => {
                assert_eq!(variable, "COLLECTOR_TEST_CONFIG")
            }
            other => panic!("Expected EnvNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_env_provider_requires_name() {
        assert!(matches!(
            EnvProvider.retrieve("env:").await,
            Err(ResolveError::InvalidUri { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_provider_bare_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "service: {}").unwrap();
        let path = file.path().display().to_string();

        assert_eq!(FileProvider.retrieve(&path).await.unwrap(), "service: {}");
        assert_eq!(
            FileProvider
                .retrieve(&format!("file:{path}"))
                .await
                .unwrap(),
            "service: {}"
        );
    }
}
