//! Post-resolution converters applied to the merged configuration.

use super::{Conf, ResolveError};
use serde_yaml::{Mapping, Value};

/// Rewrites a merged configuration in place.
pub trait Converter: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Applies the conversion.
    fn convert(&self, conf: &mut Conf) -> Result<(), ResolveError>;
}

/// Expands `${VAR}`, `${env:VAR}` and `$VAR` in string values from the
/// process environment. Unset variables expand to an empty string and `$$`
/// yields a literal `$`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpandConverter;

impl Converter for ExpandConverter {
    fn name(&self) -> &'static str {
        "expand"
    }

    fn convert(&self, conf: &mut Conf) -> Result<(), ResolveError> {
        for (_, value) in conf.as_mapping_mut().iter_mut() {
            expand_value(value);
        }
        Ok(())
    }
}

fn expand_value(value: &mut Value) {
    match value {
        Value::String(s) if s.contains('$') => *s = expand_env(s),
        Value::Mapping(mapping) => {
            for (_, nested) in mapping.iter_mut() {
                expand_value(nested);
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(expand_value),
        _ => {}
    }
}

fn expand_env(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    let name = &braced[..end];
                    let name = name.strip_prefix("env:").unwrap_or(name);
                    out.push_str(&lookup(name).unwrap_or_default());
                    rest = &braced[end + 1..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if len == 0 {
                out.push('$');
            } else {
                out.push_str(&lookup(&after[..len]).unwrap_or_default());
            }
            rest = &after[len..];
        }
    }

    out.push_str(rest);
    out
}

/// Disables the sending queue and retry-on-failure on every exporter.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableQueuedRetryConverter;

impl Converter for DisableQueuedRetryConverter {
    fn name(&self) -> &'static str {
        "disable_queued_retry"
    }

    fn convert(&self, conf: &mut Conf) -> Result<(), ResolveError> {
        let names: Vec<String> = match conf.get("exporters") {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Mapping(exporters)) => exporters
                .keys()
                .filter_map(|key| key.as_str().map(str::to_string))
                .collect(),
            Some(_) => {
                return Err(ResolveError::Converter {
                    name: self.name(),
                    message: "exporters must be a map".to_string(),
                });
            }
        };

        for name in names {
            let base = format!("exporters::{name}");
            if !matches!(conf.get(&base), Some(Value::Mapping(_))) {
                conf.set(&base, Value::Mapping(Mapping::new()));
            }
            conf.set(
                &format!("{base}::sending_queue::enabled"),
                Value::Bool(false),
            );
            conf.set(
                &format!("{base}::retry_on_failure::enabled"),
                Value::Bool(false),
            );
        }

        Ok(())
    }
}
