//! Lambda collector workspace: end-to-end tests for the collector extension.
//!
//! This package has no code of its own. The extension lives in the
//! `opentelemetry-lambda-collector` member crate; the tests in `tests/` run
//! its full lifecycle against an in-process Lambda host.
