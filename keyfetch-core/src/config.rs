//! Fetcher configuration

use crate::error::{ConfigError, KeyfetchError, KeyfetchResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Built-in field names; extensions may not reuse them.
const RESERVED_FIELDS: [&str; 5] = [
    "initial_stale",
    "dedupe_in_flight",
    "drop_superseded",
    "auto_fetch_on_params_change",
    "stale",
];

/// Fetcher-wide configuration.
///
/// One instance is shared by the whole fetcher. Staleness itself is tracked
/// per cache key; this only decides policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Whether the construction-time entry starts `Stale`, so the first
    /// `FetchData` refreshes the caller-supplied initial data.
    pub initial_stale: bool,
    /// Join an in-flight fetch for the same key instead of issuing another.
    pub dedupe_in_flight: bool,
    /// Drop a fetch result whose key was invalidated, evicted or reset while
    /// the fetch was in flight.
    pub drop_superseded: bool,
    /// Schedule a fetch whenever new parameters change the cache key.
    pub auto_fetch_on_params_change: bool,
    /// Caller-supplied extensions, carried but not interpreted.
    pub extensions: Map<String, Value>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            initial_stale: true,
            dedupe_in_flight: true,
            drop_superseded: true,
            auto_fetch_on_params_change: false,
            extensions: Map::new(),
        }
    }
}

impl FetcherConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `KEYFETCH_INITIAL_STALE` (default: true)
    /// - `KEYFETCH_DEDUPE_IN_FLIGHT` (default: true)
    /// - `KEYFETCH_DROP_SUPERSEDED` (default: true)
    /// - `KEYFETCH_AUTO_FETCH` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            initial_stale: env_flag("KEYFETCH_INITIAL_STALE").unwrap_or(defaults.initial_stale),
            dedupe_in_flight: env_flag("KEYFETCH_DEDUPE_IN_FLIGHT")
                .unwrap_or(defaults.dedupe_in_flight),
            drop_superseded: env_flag("KEYFETCH_DROP_SUPERSEDED")
                .unwrap_or(defaults.drop_superseded),
            auto_fetch_on_params_change: env_flag("KEYFETCH_AUTO_FETCH")
                .unwrap_or(defaults.auto_fetch_on_params_change),
            extensions: defaults.extensions,
        }
    }

    /// Set whether the initial entry starts stale.
    pub fn with_initial_stale(mut self, stale: bool) -> Self {
        self.initial_stale = stale;
        self
    }

    /// Enable or disable in-flight deduplication.
    pub fn with_dedupe_in_flight(mut self, enabled: bool) -> Self {
        self.dedupe_in_flight = enabled;
        self
    }

    /// Enable or disable dropping superseded fetch results.
    pub fn with_drop_superseded(mut self, enabled: bool) -> Self {
        self.drop_superseded = enabled;
        self
    }

    /// Enable or disable fetching automatically on parameter changes.
    pub fn with_auto_fetch(mut self, enabled: bool) -> Self {
        self.auto_fetch_on_params_change = enabled;
        self
    }

    /// Add a caller-supplied extension value.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Look up a caller-supplied extension value.
    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }

    /// Validate the configuration.
    ///
    /// Extensions are merged next to the built-in fields by callers that
    /// serialize the config, so a colliding name would be ambiguous.
    pub fn validate(&self) -> KeyfetchResult<()> {
        if let Some(key) = self
            .extensions
            .keys()
            .find(|k| RESERVED_FIELDS.contains(&k.as_str()))
        {
            return Err(KeyfetchError::Config(ConfigError::ReservedExtension {
                key: key.clone(),
            }));
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

// =============================================================================
// TESTS
// =============================================================================
