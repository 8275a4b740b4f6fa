//! Error types for the timeline protocol.

use thiserror::Error;

/// Errors that can occur in timeline operations.
///
/// Scope violations, missing routes and unsafe payloads are never downgraded:
/// they always propagate to the caller of the failing operation.
#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("scope violation: {field} expected {expected:?}, got {actual:?}")]
    ScopeViolation {
        field: &'static str,
        expected: String,
        actual: String,
    },
    #[error(
        "no route configured for resource {resource_kind} (tenant={tenant_id}, env={env}, project={project_id})"
    )]
    MissingRoute {
        resource_kind: String,
        tenant_id: String,
        env: String,
        project_id: String,
    },
    #[error("backend {backend} is not allowed in env {env}")]
    BackendRefused { backend: String, env: String },
    #[error("unsafe payload: {0}")]
    UnsafePayload(String),
    #[error("invalid routing: {0}")]
    InvalidRouting(String),
    #[error("key not registered: {0}")]
    UnregisteredKey(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The event reached `stored` but not `missing`; the partitions diverge.
    #[error("event {event_id} stored on {stored} but not on {missing}: {reason}")]
    PartialAppend {
        event_id: String,
        stored: String,
        missing: String,
        reason: String,
    },
    #[error("protocol violation ({code}): {message}")]
    Protocol { code: &'static str, message: String },
}

impl TimelineError {
    pub fn scope(field: &'static str, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ScopeViolation {
            field,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn protocol(code: &'static str, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code used in structured wire errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ScopeViolation { .. } => "scope_violation",
            Self::MissingRoute { .. } => "missing_route",
            Self::BackendRefused { .. } => "backend_refused",
            Self::UnsafePayload(_) => "unsafe_payload",
            Self::InvalidRouting(_) => "invalid_routing",
            Self::UnregisteredKey(_) => "unregistered_key",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::PartialAppend { .. } => "partial_append",
            Self::Protocol { code, .. } => *code,
        }
    }
}

impl From<serde_json::Error> for TimelineError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for TimelineError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

/// Convenience result type for timeline operations.
pub type TimelineResult<T> = Result<T, TimelineError>;
