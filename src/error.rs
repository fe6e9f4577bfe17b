//! Error types for the quota reconciler
//!
//! Provides structured error types for all engine components including
//! the hierarchy store, driver invocations, operator edits, and the audit
//! pipeline.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Storage connection lost: {0}")]
    StorageUnavailable(String),

    #[error("Constraint violation on {table}: {detail}")]
    ConstraintViolation { table: String, detail: String },

    #[error("Record not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    // =========================================================================
    // Driver Errors
    // =========================================================================
    #[error("Driver not registered: {driver}")]
    UnknownDriver { driver: String },

    #[error("Driver {driver} failed during {operation}: {reason}")]
    Driver {
        driver: String,
        operation: String,
        reason: String,
    },

    #[error("No driver configured for service type {service_type} in cluster {cluster_id}")]
    ServiceNotConfigured {
        cluster_id: String,
        service_type: String,
    },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Every problem found in one operator request, in request order
    #[error("{}", .0.join("\n"))]
    Validation(Vec<String>),

    #[error("Permission denied: {rule}")]
    Forbidden { rule: String },

    #[error("Caller identity missing or malformed: {0}")]
    Unauthenticated(String),

    // =========================================================================
    // Unit Errors
    // =========================================================================
    #[error("cannot convert value from {from} to {to} because units are incompatible")]
    IncompatibleUnits { from: String, to: String },

    #[error("value of {value} cannot be represented as integer number of {unit}")]
    NonIntegralConversion { value: String, unit: String },

    #[error("value of {value} does not fit into a 64-bit integer of {unit}")]
    ConversionOverflow { value: String, unit: String },

    #[error("Unit parse error: {0}")]
    UnitParse(String),

    // =========================================================================
    // Audit Errors
    // =========================================================================
    #[error("Audit publish failed: {0}")]
    AuditPublish(String),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the scrape scheduler takes when a cycle fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry on the next tick with exponential backoff
    RequeueWithBackoff,
    /// Retry after a specific duration
    RequeueAfter(Duration),
    /// Don't retry, wait for configuration changes
    NoRequeue,
}

impl Error {
    /// Build a driver error from anything displayable
    pub fn driver(driver: &str, operation: &str, reason: impl std::fmt::Display) -> Self {
        Error::Driver {
            driver: driver.to_string(),
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a not-found error
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Determine what the scheduler does after this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::StorageUnavailable(_) | Error::Driver { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            Error::ConstraintViolation { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            Error::Configuration(_)
            | Error::UnknownDriver { .. }
            | Error::ServiceNotConfigured { .. }
            | Error::Validation(_)
            | Error::IncompatibleUnits { .. }
            | Error::NonIntegralConversion { .. }
            | Error::ConversionOverflow { .. }
            | Error::UnitParse(_) => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is a caller mistake rather than a server fault
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }

    /// HTTP status code presented to API callers
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_)
            | Error::IncompatibleUnits { .. }
            | Error::NonIntegralConversion { .. }
            | Error::ConversionOverflow { .. }
            | Error::UnitParse(_) => 422,
            Error::JsonParse(_) => 400,
            Error::Unauthenticated(_) => 401,
            Error::Forbidden { .. } => 403,
            Error::NotFound { .. } => 404,
            _ => 500,
        }
    }

    /// Messages of a validation error, or the single rendered message
    pub fn messages(&self) -> Vec<String> {
        match self {
            Error::Validation(messages) => messages.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
