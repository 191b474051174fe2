//! Repository configuration, loadable from TOML.

use std::fs;
use std::path::Path;

use noderepo_store::path::validate_node_path;
use noderepo_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where a repository keeps its items and how it reaches the store.
///
/// ```toml
/// root_path = "/apps_root/cars"
///
/// [store]
/// address = "zk-1:2181,zk-2:2181"
/// retry_count = 5
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Absolute namespace path holding one child node per item.
    pub root_path: String,
    #[serde(default)]
    pub store: StoreConfig,
}

impl RepositoryConfig {
    pub fn new(root_path: impl Into<String>, store: StoreConfig) -> Self {
        Self {
            root_path: root_path.into(),
            store,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_node_path(&self.root_path)
            .map_err(|e| ConfigError::Invalid(format!("root_path: {e}")))?;
        if self.root_path == "/" {
            return Err(ConfigError::Invalid(
                "root_path must be a dedicated namespace, not the store root".into(),
            ));
        }
        if self.store.address.trim().is_empty() {
            return Err(ConfigError::Invalid("store.address is empty".into()));
        }
        Ok(())
    }
}
