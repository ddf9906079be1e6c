//! Backend connection configuration
//!
//! A `BackendConnection` identifies one remote store endpoint. It is owned
//! by the host's configuration storage, immutable during a sync run, and
//! passed explicitly to every engine operation rather than read from
//! ambient state.

use serde::{Deserialize, Serialize};

use crate::ids::BackendId;

/// Remote store REST API version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    /// Legacy v2 API.
    V2,

    /// Current v3 API.
    #[default]
    V3,
}

impl ApiVersion {
    /// Convert to the path segment used by the remote API.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V2 => "v2",
            ApiVersion::V3 => "v3",
        }
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration identifying one remote store endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConnection {
    /// Backend ID.
    pub id: BackendId,

    /// Display name.
    pub name: String,

    /// Store base URL.
    pub location: String,

    /// API consumer key.
    pub consumer_key: String,

    /// API consumer secret.
    pub consumer_secret: String,

    /// REST API version.
    #[serde(default)]
    pub version: ApiVersion,

    /// Whether to verify the server certificate.
    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// Locale records are imported in, when the store is multilingual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_locale: Option<String>,
}

fn default_true() -> bool {
    true
}

impl BackendConnection {
    /// Create a connection with default version and SSL settings.
    pub fn new(
        name: impl Into<String>,
        location: impl Into<String>,
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
    ) -> Self {
        Self {
            id: BackendId::new(),
            name: name.into(),
            location: location.into(),
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            version: ApiVersion::default(),
            verify_ssl: true,
            default_locale: None,
        }
    }

    /// Validate the connection configuration.
    ///
    /// Configuration errors are surfaced synchronously to the trigger
    /// caller; no batch work may start against an invalid backend.
    pub fn validate(&self) -> Result<(), String> {
        let location = self.location.trim();
        if location.is_empty() {
            return Err("store URL must not be empty".to_string());
        }
        if !location.starts_with("http://") && !location.starts_with("https://") {
            return Err("store URL must include http:// or https://".to_string());
        }
        if self.consumer_key.trim().is_empty() {
            return Err("consumer key must not be empty".to_string());
        }
        if self.consumer_secret.trim().is_empty() {
            return Err("consumer secret must not be empty".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("location", &self.location)
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"[REDACTED]")
            .field("version", &self.version)
            .field("verify_ssl", &self.verify_ssl)
            .field("default_locale", &self.default_locale)
            .finish()
    }
}

/// Lookup from backend id to connection configuration.
///
/// Implemented by the host's configuration storage; the worker resolves
/// the backend for each job through it.
pub trait BackendDirectory: Send + Sync {
    /// Get the connection for a backend, or `None` if unknown.
    fn get(&self, id: BackendId) -> Option<BackendConnection>;
}

impl BackendDirectory for std::collections::HashMap<BackendId, BackendConnection> {
    fn get(&self, id: BackendId) -> Option<BackendConnection> {
        std::collections::HashMap::get(self, &id).cloned()
    }
}
