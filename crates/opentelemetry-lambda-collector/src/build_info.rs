//! Build metadata for the collector.

use serde::Serialize;

const COMMAND: &str = "otelcol-lambda";
const DESCRIPTION: &str = "Lambda Collector";

/// Identifies the running collector build.
///
/// Constructed once at process start and handed to the components that need
/// it; there is no process-wide mutable copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    /// Executable name reported by the collector.
    pub command: String,
    /// Human readable description.
    pub description: String,
    /// Release version.
    pub version: String,
    /// Source revision, when the build exported `GIT_HASH`.
    pub git_hash: Option<String>,
}

impl BuildInfo {
    /// Creates build info for an arbitrary version.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            command: COMMAND.to_string(),
            description: DESCRIPTION.to_string(),
            version: version.into(),
            git_hash: None,
        }
    }

    /// Build info for this binary, taken from the compile-time environment.
    pub fn current() -> Self {
        Self {
            git_hash: option_env!("GIT_HASH").map(str::to_string),
            ..Self::new(env!("CARGO_PKG_VERSION"))
        }
    }

    /// Sets the source revision.
    pub fn with_git_hash(mut self, hash: impl Into<String>) -> Self {
        self.git_hash = Some(hash.into());
        self
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.command, self.version)?;
        if let Some(hash) = &self.git_hash {
            write!(f, " ({hash})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_uses_package_version() {
        let info = BuildInfo::current();

        assert_eq!(info.command, "otelcol-lambda");
        assert_eq!(info.description, "Lambda Collector");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_display() {
        let info = BuildInfo::new("1.2.3");
        assert_eq!(info.to_string(), "otelcol-lambda 1.2.3");

        let info = info.with_git_hash("abc123");
        assert_eq!(info.to_string(), "otelcol-lambda 1.2.3 (abc123)");
    }
}
