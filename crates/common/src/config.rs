//! Shared configuration types for live-worker components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Environment variable holding the tracing filter directives.
pub const LOG_FILTER_VAR: &str = "RUST_LOG";

/// Environment variable enabling JSON-formatted logs.
pub const LOG_JSON_VAR: &str = "LW_LOG_JSON";

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directives (`RUST_LOG` syntax)
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl ObservabilityConfig {
    /// Build from environment-style variables, falling back to `default_filter`.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>, default_filter: &str) -> Self {
        let log_filter = vars
            .get(LOG_FILTER_VAR)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| default_filter.to_string());

        let json_logs = vars
            .get(LOG_JSON_VAR)
            .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

        Self {
            log_filter,
            json_logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ObservabilityConfig::from_vars(&HashMap::new(), "live_worker=info");
        assert_eq!(config.log_filter, "live_worker=info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            (LOG_FILTER_VAR.to_string(), "live_worker=trace".to_string()),
            (LOG_JSON_VAR.to_string(), "TRUE".to_string()),
        ]);
        let config = ObservabilityConfig::from_vars(&vars, "live_worker=info");
        assert_eq!(config.log_filter, "live_worker=trace");
        assert!(config.json_logs);
    }

    #[test]
    fn test_blank_filter_uses_default() {
        let vars = HashMap::from([(LOG_FILTER_VAR.to_string(), "  ".to_string())]);
        let config = ObservabilityConfig::from_vars(&vars, "info");
        assert_eq!(config.log_filter, "info");
    }
}
