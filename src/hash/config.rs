// Hash lookup settings
// The persisted, ordered list of configured hash sets

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::HashDbError;
use super::hash_set::Classification;
use super::parser::SourceFormat;

/// Settings file name inside the configuration directory
pub const SETTINGS_FILE: &str = "hash_lookup.toml";
const APP_DIR: &str = "hashlookup";

/// Configured hash sets, in priority order within each classification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashLookupSettings {
    #[serde(default, rename = "hash_set")]
    pub hash_sets: Vec<HashSetInfo>,
}

/// One configured hash set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashSetInfo {
    pub name: String,
    pub classification: Classification,
    /// Source file, database or prebuilt index of a local set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Explicit source format; detected from the file name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<SourceFormat>,
    /// Reference set id of a remote set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_set_id: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_search_enabled")]
    pub search_enabled: bool,
    /// Defaults per classification when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_on_hit: Option<bool>,
}

fn default_search_enabled() -> bool {
    true
}

impl HashSetInfo {
    pub fn local(name: impl Into<String>, classification: Classification, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            classification,
            path: Some(path.into()),
            format: None,
            reference_set_id: None,
            version: String::new(),
            read_only: false,
            search_enabled: default_search_enabled(),
            notify_on_hit: None,
        }
    }

    pub fn remote(
        name: impl Into<String>,
        classification: Classification,
        reference_set_id: i64,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            classification,
            path: None,
            format: None,
            reference_set_id: Some(reference_set_id),
            version: version.into(),
            read_only: false,
            search_enabled: default_search_enabled(),
            notify_on_hit: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.reference_set_id.is_some()
    }

    /// Effective notification flag
    pub fn notify(&self) -> bool {
        self.notify_on_hit
            .unwrap_or_else(|| self.classification.default_notify())
            && self.classification.allows_inbox_messages()
    }
}

impl HashLookupSettings {
    /// `<config_dir>/hashlookup/hash_lookup.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
    }

    /// Load settings; a missing file yields empty settings
    pub fn load(path: &Path) -> Result<Self, HashDbError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no hash lookup settings, starting empty");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| HashDbError::from_io_error(e, "reading settings", Some(path.to_path_buf())))?;
        toml::from_str(&text).map_err(|e| HashDbError::ConfigError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write settings through a temp file renamed into place
    pub fn save(&self, path: &Path) -> Result<(), HashDbError> {
        let text = toml::to_string_pretty(self).map_err(|e| HashDbError::ConfigError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                HashDbError::from_io_error(e, "creating settings directory", Some(parent.to_path_buf()))
            })?;
        }

        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        fs::write(&tmp_path, text)
            .map_err(|e| HashDbError::from_io_error(e, "writing settings", Some(tmp_path.clone())))?;
        fs::rename(&tmp_path, path)
            .map_err(|e| HashDbError::from_io_error(e, "saving settings", Some(path.to_path_buf())))
    }
}
