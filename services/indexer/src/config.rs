//! Indexer configuration.
//!
//! Settings come from a JSON file, with an optional secrets file deep-merged
//! over it (endpoint credentials usually live there). Command-line overrides
//! are applied by the binary after loading.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Largest `first:` argument the subgraph accepts.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// GraphQL endpoint of the marketplace subgraph.
    pub subgraph_url: String,
    /// Base URL of the orderbook service.
    pub orderbook_url: String,
    pub database_path: PathBuf,
    pub poll_interval_ms: u64,
    pub sweep_interval_secs: u64,
    /// Events requested per upstream page.
    pub page_size: usize,
    /// Pending events re-delivered per sweep.
    pub sweep_batch_size: usize,
    pub request_timeout_ms: u64,
    /// Status server bind address; disabled when unset.
    pub status_addr: Option<SocketAddr>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            subgraph_url: String::new(),
            orderbook_url: String::new(),
            database_path: PathBuf::from("data/indexer.db"),
            poll_interval_ms: 1000,
            sweep_interval_secs: 3600,
            page_size: 100,
            sweep_batch_size: 50,
            request_timeout_ms: 10_000,
            status_addr: None,
        }
    }
}

impl IndexerConfig {
    /// Load settings, deep-merging the secrets file over them.
    ///
    /// Either file may be omitted. A secrets path that does not exist is
    /// skipped.
    pub fn load(settings: Option<&Path>, secrets: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = Value::Object(Default::default());

        if let Some(path) = settings {
            merge(&mut merged, read_json(path)?);
        }
        if let Some(path) = secrets {
            if path.exists() {
                merge(&mut merged, read_json(path)?);
            } else {
                debug!(path = %path.display(), "No secrets file, skipping");
            }
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subgraph_url.trim().is_empty() {
            return Err(ConfigError::Invalid("subgraph_url is required".into()));
        }
        if self.orderbook_url.trim().is_empty() {
            return Err(ConfigError::Invalid("orderbook_url is required".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be positive".into()));
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "page_size must not exceed {MAX_PAGE_SIZE}"
            )));
        }
        if self.sweep_batch_size == 0 {
            return Err(ConfigError::Invalid("sweep_batch_size must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// any other value replaces what was there.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn json_file(value: Value) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", value).unwrap();
        file
    }

    fn valid() -> IndexerConfig {
        IndexerConfig {
            subgraph_url: "http://subgraph.local/graphql".into(),
            orderbook_url: "http://orderbook.local".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = IndexerConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.sweep_interval(), Duration::from_secs(3600));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.sweep_batch_size, 50);
        assert_eq!(config.status_addr, None);
    }

    #[test]
    fn test_merge_is_deep() {
        let mut base = json!({ "a": { "x": 1, "y": 2 }, "b": [1, 2] });
        merge(&mut base, json!({ "a": { "y": 3, "z": 4 }, "b": [9] }));
        assert_eq!(base, json!({ "a": { "x": 1, "y": 3, "z": 4 }, "b": [9] }));
    }

    #[test]
    fn test_load_merges_secrets_over_settings() {
        let settings = json_file(json!({
            "subgraph_url": "http://subgraph.local/graphql",
            "orderbook_url": "http://placeholder",
            "page_size": 25
        }));
        let secrets = json_file(json!({ "orderbook_url": "http://orderbook.internal" }));

        let config = IndexerConfig::load(Some(settings.path()), Some(secrets.path())).unwrap();

        assert_eq!(config.orderbook_url, "http://orderbook.internal");
        assert_eq!(config.page_size, 25);
        assert_eq!(config.sweep_batch_size, 50);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_secrets_file_is_skipped() {
        let settings = json_file(json!({ "poll_interval_ms": 250 }));
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("secrets.json");

        let config = IndexerConfig::load(Some(settings.path()), Some(&absent)).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
    }

    #[test]
    fn test_load_reports_bad_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = IndexerConfig::load(Some(file.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_reports_wrong_types() {
        let settings = json_file(json!({ "page_size": "lots" }));
        let err = IndexerConfig::load(Some(settings.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Decode(_)));
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(IndexerConfig::default().validate().is_err());

        let mut config = valid();
        config.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.page_size = MAX_PAGE_SIZE;
        assert!(config.validate().is_ok());
        config.page_size = MAX_PAGE_SIZE + 1;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("page_size")));

        let mut config = valid();
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.orderbook_url = "  ".into();
        assert!(config.validate().is_err());
    }
}
