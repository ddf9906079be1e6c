//! Remote store error types
//!
//! Error definitions with transient/conflict/permanent classification.
//! Transient errors are retried by the job queue with backoff; conflicts
//! are never retried and escalate straight to the checkpoint sink;
//! everything else is permanent and surfaces to the caller.

use thiserror::Error;

/// Error that can occur while talking to a remote store.
#[derive(Debug, Error)]
pub enum ConnectorError {
    // Connection errors (transient)
    /// Failed to establish a connection to the remote store.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection timed out.
    #[error("connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout { timeout_secs: u64 },

    /// Remote store is temporarily unavailable.
    #[error("remote store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Network error during communication.
    #[error("network error: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Remote store asked us to slow down.
    #[error("rate limited by remote store")]
    RateLimited,

    // Authentication/configuration errors (permanent)
    /// Invalid credentials.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    /// Backend configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // Operation errors
    /// Record already exists in the remote store (create conflict).
    #[error("record already exists: {identifier}")]
    RecordAlreadyExists { identifier: String },

    /// Record not found in the remote store.
    #[error("record not found: {identifier}")]
    RecordNotFound { identifier: String },

    /// Remote payload is malformed or missing required data.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ConnectorError {
    /// Check if this error is transient and the operation should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed { .. }
                | ConnectorError::ConnectionTimeout { .. }
                | ConnectorError::StoreUnavailable { .. }
                | ConnectorError::NetworkError { .. }
                | ConnectorError::RateLimited
        )
    }

    /// Check if this error signals a matching ambiguity rather than a
    /// transient fault. Conflicts are never retried; they escalate to a
    /// checkpoint.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ConnectorError::RecordAlreadyExists { .. })
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Get a stable error code for audit rows.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ConnectorError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            ConnectorError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            ConnectorError::NetworkError { .. } => "NETWORK_ERROR",
            ConnectorError::RateLimited => "RATE_LIMITED",
            ConnectorError::AuthenticationFailed => "AUTH_FAILED",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::RecordAlreadyExists { .. } => "RECORD_EXISTS",
            ConnectorError::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            ConnectorError::InvalidData { .. } => "INVALID_DATA",
            ConnectorError::Serialization(_) => "SERIALIZATION_ERROR",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        ConnectorError::NetworkError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        ConnectorError::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        ConnectorError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create a record already exists error.
    pub fn already_exists(identifier: impl Into<String>) -> Self {
        ConnectorError::RecordAlreadyExists {
            identifier: identifier.into(),
        }
    }

    /// Create a record not found error.
    pub fn not_found(identifier: impl Into<String>) -> Self {
        ConnectorError::RecordNotFound {
            identifier: identifier.into(),
        }
    }

    /// Create an invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        ConnectorError::InvalidData {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with source.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type for remote store operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
