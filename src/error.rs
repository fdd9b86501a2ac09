//! # Error Taxonomy
//!
//! VisionOps classifies every fallible operation into one of six kinds rather than one
//! exception type per failure site: `TransientIo`, `Exhaustion`, `Integrity`, `Policy`,
//! `Configuration`, `Fatal`. Each variant carries an [`ErrorContext`] with a timestamp,
//! the operation in progress, optional free-text context, a recovery suggestion, and a
//! severity. [`Retryable`] and [`Recoverable`] classify a variant's handling without the
//! caller needing to match on it directly.
//!
//! Propagation policy: a component handles what it can locally (retry, drop, fall back)
//! and escalates the rest. Only the Lifecycle Supervisor turns an error into process-level
//! action (exit code, restart).

use std::{error::Error as StdError, fmt, time::SystemTime};

/// Severity levels, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

/// Metadata attached to every [`VisionOpsError`] variant.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub timestamp: SystemTime,
    pub operation: Option<String>,
    pub context: Option<String>,
    pub recovery_suggestion: Option<String>,
    pub severity: ErrorSeverity,
    pub metadata: std::collections::HashMap<String, String>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::now(),
            operation: None,
            context: None,
            recovery_suggestion: None,
            severity: ErrorSeverity::Error,
            metadata: std::collections::HashMap::new(),
        }
    }
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_recovery_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.recovery_suggestion = Some(suggestion.into());
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The six error kinds named in the error handling design.
#[derive(Debug)]
pub enum VisionOpsError {
    /// Stream stall, HTTPS 5xx, DB busy — retried with backoff at the component level.
    TransientIo {
        operation: String,
        reason: String,
        context: ErrorContext,
    },
    /// Buffer pool cap, inference queue full, disk full — fails fast with an explicit kind.
    Exhaustion {
        resource: String,
        reason: String,
        context: ErrorContext,
    },
    /// Malformed frame bytes, model shape mismatch, DB constraint — never retried.
    Integrity {
        subject: String,
        reason: String,
        context: ErrorContext,
    },
    /// Age-expired frame, late aggregation sample, circuit open — dropped with a counted metric.
    Policy {
        rule: String,
        reason: String,
        context: ErrorContext,
    },
    /// Missing camera URL, unreachable endpoint at startup — fatal at startup, warning at runtime.
    Configuration {
        field: String,
        reason: String,
        context: ErrorContext,
    },
    /// Panic, pool corruption, model load — captured by the supervisor, exit code 5.
    Fatal {
        reason: String,
        source: Option<Box<dyn StdError + Send + Sync>>,
        context: ErrorContext,
    },
}

impl VisionOpsError {
    pub fn transient_io(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientIo {
            operation: operation.into(),
            reason: reason.into(),
            context: ErrorContext::new()
                .with_severity(ErrorSeverity::Warning)
                .with_recovery_suggestion("retry with backoff"),
        }
    }

    pub fn exhaustion(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Exhaustion {
            resource: resource.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Error),
        }
    }

    pub fn integrity(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Error),
        }
    }

    pub fn policy(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Policy {
            rule: rule.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Info),
        }
    }

    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Critical),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
            source: None,
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    pub fn fatal_with_source(
        reason: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Fatal {
            reason: reason.into(),
            source: Some(Box::new(source)),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Short machine-stable name of the kind, used for health-snapshot error counts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientIo { .. } => "transient_io",
            Self::Exhaustion { .. } => "exhaustion",
            Self::Integrity { .. } => "integrity",
            Self::Policy { .. } => "policy",
            Self::Configuration { .. } => "configuration",
            Self::Fatal { .. } => "fatal",
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::TransientIo { context, .. }
            | Self::Exhaustion { context, .. }
            | Self::Integrity { context, .. }
            | Self::Policy { context, .. }
            | Self::Configuration { context, .. }
            | Self::Fatal { context, .. } => context,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        match &mut self {
            Self::TransientIo { context: c, .. }
            | Self::Exhaustion { context: c, .. }
            | Self::Integrity { context: c, .. }
            | Self::Policy { context: c, .. }
            | Self::Configuration { context: c, .. }
            | Self::Fatal { context: c, .. } => {
                c.context = Some(context.into());
            }
        }
        self
    }
}

impl fmt::Display for VisionOpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientIo { operation, reason, .. } => {
                write!(f, "transient I/O during {operation}: {reason}")
            }
            Self::Exhaustion { resource, reason, .. } => {
                write!(f, "{resource} exhausted: {reason}")
            }
            Self::Integrity { subject, reason, .. } => {
                write!(f, "integrity violation in {subject}: {reason}")
            }
            Self::Policy { rule, reason, .. } => write!(f, "policy {rule}: {reason}"),
            Self::Configuration { field, reason, .. } => {
                write!(f, "configuration error in {field}: {reason}")
            }
            Self::Fatal { reason, .. } => write!(f, "fatal: {reason}"),
        }
    }
}

impl StdError for VisionOpsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Fatal { source: Some(s), .. } => Some(s.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VisionOpsError {
    fn from(e: std::io::Error) -> Self {
        Self::transient_io("io", e.to_string())
    }
}

impl From<rusqlite::Error> for VisionOpsError {
    fn from(e: rusqlite::Error) -> Self {
        Self::integrity("local_store", e.to_string())
    }
}

impl From<reqwest::Error> for VisionOpsError {
    fn from(e: reqwest::Error) -> Self {
        Self::transient_io("replicator_http", e.to_string())
    }
}

impl From<serde_json::Error> for VisionOpsError {
    fn from(e: serde_json::Error) -> Self {
        Self::integrity("serialisation", e.to_string())
    }
}

impl From<toml::de::Error> for VisionOpsError {
    fn from(e: toml::de::Error) -> Self {
        Self::configuration("file", e.to_string())
    }
}

/// Errors the component itself may retry without escalating.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    fn retry_delay_ms(&self) -> u64;
    fn max_retries(&self) -> u32;
}

impl Retryable for VisionOpsError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    fn retry_delay_ms(&self) -> u64 {
        match self {
            Self::TransientIo { .. } => 1000,
            _ => 0,
        }
    }

    fn max_retries(&self) -> u32 {
        match self {
            Self::TransientIo { .. } => 5,
            _ => 0,
        }
    }
}

/// Errors a component can fall back from without a full restart.
pub trait Recoverable {
    fn is_recoverable(&self) -> bool;
}

impl Recoverable for VisionOpsError {
    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Fatal { .. } | Self::Integrity { .. })
    }
}

/// Cheap classification helpers used by the Supervisor and health snapshot.
pub mod classify {
    use super::VisionOpsError;

    pub fn is_transient(e: &VisionOpsError) -> bool {
        matches!(e, VisionOpsError::TransientIo { .. })
    }

    pub fn is_fatal(e: &VisionOpsError) -> bool {
        matches!(e, VisionOpsError::Fatal { .. })
    }

    pub fn requires_operator_intervention(e: &VisionOpsError) -> bool {
        matches!(
            e,
            VisionOpsError::Fatal { .. } | VisionOpsError::Configuration { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VisionOpsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_is_retryable_with_budget() {
        let e = VisionOpsError::transient_io("capture_pipe_read", "stream stalled");
        assert!(e.is_retryable());
        assert!(e.max_retries() > 0);
        assert!(e.is_recoverable());
    }

    #[test]
    fn fatal_is_neither_retryable_nor_recoverable() {
        let e = VisionOpsError::fatal("inference session corrupted");
        assert!(!e.is_retryable());
        assert!(!e.is_recoverable());
        assert!(classify::is_fatal(&e));
        assert!(classify::requires_operator_intervention(&e));
    }

    #[test]
    fn configuration_error_requires_operator_intervention() {
        let e = VisionOpsError::configuration("cameras[0].url", "missing");
        assert!(classify::requires_operator_intervention(&e));
        assert!(!classify::is_transient(&e));
    }

    #[test]
    fn context_builder_attaches_free_text() {
        let e = VisionOpsError::exhaustion("buffer_pool", "cap reached").with_context("rent(640*480*3)");
        assert_eq!(e.context().context.as_deref(), Some("rent(640*480*3)"));
    }
}
