//! Error types for keyfetch operations

use thiserror::Error;

/// Cache key derivation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Parameters cannot be serialized into a cache key: {reason}")]
    Serialization { reason: String },
}

/// Errors raised by (or on behalf of) the external fetch source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed for key {key}: {reason}")]
    Failed { key: String, reason: String },

    #[error("Fetch source returned an error: {reason}")]
    Source { reason: String },

    #[error("In-flight fetch for key {key} was abandoned before it resolved")]
    Abandoned { key: String },
}

impl FetchError {
    /// Wrap any displayable source error.
    pub fn source(reason: impl std::fmt::Display) -> Self {
        Self::Source {
            reason: reason.to_string(),
        }
    }

    /// Attach the cache key the failed fetch was issued for.
    pub fn for_key(self, key: &str) -> Self {
        match self {
            Self::Source { reason } => Self::Failed {
                key: key.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// In-memory store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store lock poisoned: {store}")]
    LockPoisoned { store: &'static str },

    #[error("No async runtime available to schedule a fetch")]
    NoRuntime,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Extension key '{key}' shadows a built-in config field")]
    ReservedExtension { key: String },
}

/// Master error type for all keyfetch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyfetchError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl KeyfetchError {
    /// True if retrying the triggering dispatch may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}

/// Result type alias for keyfetch operations.
pub type KeyfetchResult<T> = Result<T, KeyfetchError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_error_display() {
        let err = KeyError::Serialization {
            reason: "key must be a string".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("cannot be serialized"));
        assert!(msg.contains("key must be a string"));
    }

    #[test]
    fn test_fetch_error_for_key_wraps_source() {
        let err = FetchError::source("connection reset").for_key(r#"{"userId":2}"#);
        assert_eq!(
            err,
            FetchError::Failed {
                key: r#"{"userId":2}"#.to_string(),
                reason: "connection reset".to_string(),
            }
        );
        let msg = format!("{}", err);
        assert!(msg.contains("userId"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_fetch_error_for_key_keeps_abandoned() {
        let err = FetchError::Abandoned {
            key: "{}".to_string(),
        };
        assert_eq!(err.clone().for_key("other"), err);
    }

    #[test]
    fn test_store_error_display_lock_poisoned() {
        let err = StoreError::LockPoisoned { store: "cache" };
        let msg = format!("{}", err);
        assert!(msg.contains("lock poisoned"));
        assert!(msg.contains("cache"));
    }

    #[test]
    fn test_config_error_display_reserved_extension() {
        let err = ConfigError::ReservedExtension {
            key: "initial_stale".to_string(),
        };
        assert!(format!("{}", err).contains("initial_stale"));
    }

    #[test]
    fn test_keyfetch_error_from_variants() {
        let key = KeyfetchError::from(KeyError::Serialization {
            reason: "x".to_string(),
        });
        assert!(matches!(key, KeyfetchError::Key(_)));
        assert!(!key.is_recoverable());

        let fetch = KeyfetchError::from(FetchError::source("boom"));
        assert!(matches!(fetch, KeyfetchError::Fetch(_)));
        assert!(fetch.is_recoverable());

        let store = KeyfetchError::from(StoreError::NoRuntime);
        assert!(matches!(store, KeyfetchError::Store(_)));

        let config = KeyfetchError::from(ConfigError::ReservedExtension {
            key: "k".to_string(),
        });
        assert!(matches!(config, KeyfetchError::Config(_)));
    }
}
