//! # Error Handling for DataForge
//!
//! All failures surfaced by the engine are variants of [`DataForgeError`].
//! Variants carry enough context to be categorized by the taxonomy in
//! [`super::taxonomy`] and rendered to users with remediation suggestions.
//!
//! ## Error Categories
//!
//! ### Structural errors
//! - [`DataForgeError::CyclicPipeline`] - a pipeline graph contains a cycle
//! - [`DataForgeError::ValidationError`] - input records or configuration
//!   failed validation
//!
//! ### Provider errors
//! - [`DataForgeError::InvalidFileFormat`] - a file provider could not parse
//!   its input
//! - [`DataForgeError::ApiError`] - an HTTP provider or webhook call failed
//! - [`DataForgeError::NetworkTimeout`] - an external call exceeded its
//!   configured timeout
//! - [`DataForgeError::ScriptError`] - the sandboxed script provider failed
//!
//! ### Store errors
//! - [`DataForgeError::DatabaseError`] - an embedded-store operation failed
//! - [`DataForgeError::NotFound`] - an explicitly queried entity is missing
//!
//! ### Lifecycle errors
//! - [`DataForgeError::Cancelled`] - the operation's cancellation token
//!   fired; the store is left unchanged
//! - [`DataForgeError::ExpiredRollbackPoint`] - a referenced version was
//!   deleted by retention before restore
//!
//! ## Conversion
//!
//! `From` impls cover the usual boundaries:
//!
//! - `diesel::result::Error` → [`DataForgeError::DatabaseError`] (with the
//!   `database` feature)
//! - `reqwest::Error` → [`DataForgeError::NetworkTimeout`] or
//!   [`DataForgeError::ApiError`]
//! - `serde_json::Error` → [`DataForgeError::SerializationError`]
//! - `std::io::Error` → [`DataForgeError::IoError`]

/// Primary error type for all DataForge operations.
#[derive(Debug, thiserror::Error)]
pub enum DataForgeError {
    /// A pipeline node graph contains a cycle and cannot be ordered.
    #[error("Pipeline {pipeline} contains a cycle")]
    CyclicPipeline {
        /// Id of the pipeline that failed topological ordering
        pipeline: String,
    },

    /// Input data or configuration failed validation.
    #[error("Validation error: {message}")]
    ValidationError { message: String },

    /// A file provider could not parse its input.
    #[error("Invalid file format for {path}: {message}")]
    InvalidFileFormat { path: String, message: String },

    /// Failed to serialize data to JSON.
    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    /// Failed to deserialize JSON into the expected shape.
    #[error("Deserialization error: {message}")]
    DeserializationError { message: String },

    /// Embedded-store operation failure.
    #[error("Database error: {message}")]
    DatabaseError { message: String },

    /// External API call failure (provider fetch or webhook delivery).
    #[error("API error: {message}")]
    ApiError { message: String },

    /// An external call exceeded its configured timeout.
    #[error("Network timeout after {timeout_secs}s calling {url}")]
    NetworkTimeout { url: String, timeout_secs: u64 },

    /// The sandboxed script provider failed or returned an invalid value.
    #[error("Script error: {message}")]
    ScriptError { message: String },

    /// A requested capability is not available for this provider.
    #[error("Unsupported feature: {feature}")]
    UnsupportedFeature { feature: String },

    /// A rollback point references a version that no longer exists.
    #[error("Rollback point {point_id} is expired")]
    ExpiredRollbackPoint { point_id: String },

    /// The operation's cancellation token fired.
    #[error("Operation cancelled by user")]
    Cancelled,

    /// An explicitly queried entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `"project"` or `"data source"`
        entity: &'static str,
        id: String,
    },

    /// The operation conflicts with current state, e.g. re-executing a
    /// running bulk operation.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Inferred or declared schema is incompatible with stored data.
    #[error("Schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// Invalid configuration supplied at startup or per entity.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Filesystem operation failure.
    #[error("I/O error: {message}")]
    IoError { message: String },

    /// General processing failure that fits no more specific variant.
    #[error("Processing error: {message}")]
    ProcessingError { message: String },
}

impl DataForgeError {
    /// True when the error is worth retrying with backoff (see §7 of the
    /// taxonomy rules): timeouts, rate limits and transient connection
    /// failures. Validation, permission and data-corruption failures are
    /// final.
    pub fn is_retryable(&self) -> bool {
        super::taxonomy::is_retryable(&super::taxonomy::classify(self).code)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DataForgeError::ValidationError {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        DataForgeError::ProcessingError {
            message: message.into(),
        }
    }
}

#[cfg(feature = "database")]
impl From<diesel::result::Error> for DataForgeError {
    fn from(error: diesel::result::Error) -> Self {
        DataForgeError::DatabaseError {
            message: error.to_string(),
        }
    }
}

impl From<reqwest::Error> for DataForgeError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            DataForgeError::NetworkTimeout {
                url: error
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "<unknown>".to_string()),
                timeout_secs: 0,
            }
        } else {
            DataForgeError::ApiError {
                message: error.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for DataForgeError {
    fn from(error: serde_json::Error) -> Self {
        DataForgeError::SerializationError {
            message: error.to_string(),
        }
    }
}

impl From<std::io::Error> for DataForgeError {
    fn from(error: std::io::Error) -> Self {
        DataForgeError::IoError {
            message: error.to_string(),
        }
    }
}
