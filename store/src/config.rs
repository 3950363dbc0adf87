//! Store configuration.

use crate::{
    error::Result,
    MAX_TTL_SECS,
};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_value_threshold() -> usize {
    4096
}

/// Configures where and how an [`Engine`][crate::engine::Engine] stores its data.
///
/// Deserializes from YAML or JSON. Keys we don't know about are ignored.
#[derive(Builder, Clone, Debug, Deserialize, Getters, CopyGetters)]
#[builder(pattern = "owned")]
pub struct StoreConfig {
    /// Where the record log lives. Created on open if it doesn't exist.
    #[serde(alias = "dir")]
    #[builder(setter(into))]
    #[getset(get = "pub")]
    directory: PathBuf,

    /// Where the value log lives, if somewhere other than `directory`.
    #[serde(default, alias = "value_dir", alias = "valueDirectory")]
    #[builder(default, setter(into, strip_option))]
    #[getset(get = "pub")]
    value_directory: Option<PathBuf>,

    /// Encoded records at least this big go to the value log instead of being held in memory.
    #[serde(default = "default_value_threshold")]
    #[builder(default = "default_value_threshold()")]
    #[getset(get_copy = "pub")]
    value_threshold: usize,

    /// fsync on every commit. Slower, but a committed batch survives power loss.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    sync_writes: bool,

    /// If set, messages expire this many seconds after they're written. Capped at 24 hours.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    default_ttl_secs: Option<u64>,

    /// If set, a background thread removes expired messages this often.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    sweep_interval_ms: Option<u64>,
}

impl StoreConfig {
    /// Parse a config from a YAML (or JSON) string.
    pub fn parse(config: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(config)?)
    }

    /// The directory holding the value log
    pub fn value_dir(&self) -> &Path {
        self.value_directory
            .as_deref()
            .unwrap_or(&self.directory)
    }

    /// The TTL applied to new messages, clamped to the maximum.
    pub fn default_ttl_secs(&self) -> Option<u64> {
        self.default_ttl_secs.map(|ttl| ttl.min(MAX_TTL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn parse_json() {
        let config = StoreConfig::parse(r#"{"dir": "/tmp/tidepool", "value_dir": "/tmp/tidepool-values", "bananas": true}"#).unwrap();
        assert_eq!(config.directory(), &PathBuf::from("/tmp/tidepool"));
        assert_eq!(config.value_dir(), Path::new("/tmp/tidepool-values"));
        assert_eq!(config.value_threshold(), 4096);
        assert_eq!(config.sync_writes(), false);
        assert_eq!(config.default_ttl_secs(), None);
    }

    #[test]
    fn parse_yaml() {
        let yaml = "
directory: /var/lib/tidepool
valueDirectory: /mnt/big/tidepool
value_threshold: 128
sync_writes: true
default_ttl_secs: 999999
sweep_interval_ms: 500
";
        let config = StoreConfig::parse(yaml).unwrap();
        assert_eq!(config.directory(), &PathBuf::from("/var/lib/tidepool"));
        assert_eq!(config.value_dir(), Path::new("/mnt/big/tidepool"));
        assert_eq!(config.value_threshold(), 128);
        assert_eq!(config.sync_writes(), true);
        assert_eq!(config.default_ttl_secs(), Some(MAX_TTL_SECS));
        assert_eq!(config.sweep_interval_ms(), Some(500));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(StoreConfig::parse("{\"dir\": "), Err(Error::ConfigParse(_))));
        // a directory is required
        assert!(matches!(StoreConfig::parse("{\"value_dir\": \"/tmp\"}"), Err(Error::ConfigParse(_))));
    }

    #[test]
    fn builder() {
        let config = StoreConfigBuilder::default()
            .directory("/tmp/tidepool")
            .default_ttl_secs(60)
            .build()
            .unwrap();
        assert_eq!(config.value_dir(), Path::new("/tmp/tidepool"));
        assert_eq!(config.value_threshold(), 4096);
        assert_eq!(config.default_ttl_secs(), Some(60));
        assert_eq!(config.sweep_interval_ms(), None);
    }
}
