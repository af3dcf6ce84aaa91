//! The `tinifier.yml` configuration file.
//!
//! Every field is optional; loading a file populates only the fields it
//! actually contains, so layered sources can be merged in override
//! order with [`FileConfig::merge`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the configuration file inside the OS config directory.
pub const CONFIG_FILE_NAME: &str = "tinifier.yml";

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("io error while reading configuration file")]
    Io(#[from] std::io::Error),

    #[error("error parsing configuration file")]
    Parse(#[from] serde_yaml::Error),
}

/// The recognized configuration fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    /// API keys for the compression service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_keys: Option<Vec<String>>,
}

impl FileConfig {
    /// Reads and decodes a configuration file.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Applies `overrides` on top of `self`: fields present in
    /// `overrides` win, absent fields keep the earlier value.
    #[must_use]
    pub fn merge(self, overrides: FileConfig) -> FileConfig {
        FileConfig {
            api_keys: overrides.api_keys.or(self.api_keys),
        }
    }
}

/// The OS-specific default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_full_file_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "apiKeys:\n  - alpha\n  - beta\n").unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(
            config.api_keys,
            Some(vec!["alpha".to_string(), "beta".to_string()])
        );
    }

    #[test]
    fn absent_fields_stay_unset() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{}\n").unwrap();

        assert_eq!(FileConfig::load(&path).unwrap(), FileConfig::default());
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "apiKeys: {not a list\n").unwrap();

        assert!(matches!(
            FileConfig::load(&path).unwrap_err(),
            LoadError::Parse(_)
        ));
    }

    #[test]
    fn merge_prefers_present_fields_from_the_override() {
        let base = FileConfig {
            api_keys: Some(vec!["old".to_string()]),
        };

        let merged = base.clone().merge(FileConfig::default());
        assert_eq!(merged.api_keys, Some(vec!["old".to_string()]));

        let merged = base.merge(FileConfig {
            api_keys: Some(vec!["new".to_string()]),
        });
        assert_eq!(merged.api_keys, Some(vec!["new".to_string()]));
    }
}
