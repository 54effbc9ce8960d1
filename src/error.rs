//! Error types for shroud

use thiserror::Error;

/// Result type for shroud operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for shroud
///
/// Nothing in this taxonomy is fatal to the protected page: every variant
/// has a degradation path (fallback persona, next injection strategy,
/// untouched native result, ephemeral state).
#[derive(Debug, Error)]
pub enum Error {
    /// Persona catalog could not be fetched or parsed
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// An injection strategy did not confirm readiness in time
    #[error("Injection timeout: strategy '{strategy}' (correlation {correlation_id})")]
    InjectionTimeout {
        strategy: &'static str,
        correlation_id: String,
    },

    /// A pending bridge request timed out
    #[error("Bridge timeout: no response for request {id} within {timeout_ms}ms")]
    BridgeTimeout { id: String, timeout_ms: u64 },

    /// The bridge transport is gone (peer dropped, channel closed)
    #[error("Bridge closed: {0}")]
    BridgeClosed(String),

    /// Session-scoped storage failed; callers degrade to ephemeral state
    #[error("Storage error: {0}")]
    Storage(String),

    /// A mitigator failed to apply; the native surface stays in place
    #[error("Mitigation error on {surface}: {message}")]
    MitigationApply {
        surface: &'static str,
        message: String,
    },

    /// Permission-style denial surfaced to the page (WebRTC block mode)
    #[error("NotAllowedError: {0}")]
    PermissionDenied(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a catalog error
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog(message.into())
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a mitigation error for a surface
    pub fn mitigation(surface: &'static str, message: impl Into<String>) -> Self {
        Self::MitigationApply {
            surface,
            message: message.into(),
        }
    }

    /// Create a permission-style denial
    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    /// Check if this is a permission-style denial as seen by page script
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
    }
}
