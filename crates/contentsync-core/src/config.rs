//! Sync and scan configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::category::{Category, CategoryMatcher};
use crate::error::ConfigError;
use crate::planner::SyncPolicy;

/// File name of the persisted sync state inside the staging root.
pub const STATE_FILE_NAME: &str = ".contentsync-state.json";

/// Configuration of a sync orchestrator.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct SyncConfig {
    /// URL of the content metadata document.
    pub metadata_url: String,

    /// URL of the optional content structure document.
    #[builder(default, setter(into, strip_option))]
    #[serde(default)]
    pub structure_url: Option<String>,

    /// Live content directory.
    pub content_root: PathBuf,

    /// Directory where downloads are staged before being applied.
    pub staging_root: PathBuf,

    /// Archive unpacked into an empty content root on first run.
    #[builder(default, setter(into, strip_option))]
    #[serde(default)]
    pub bootstrap_archive: Option<PathBuf>,

    /// Known categories and whether each is synced.
    #[builder(default = "Category::builtin()")]
    #[serde(default = "Category::builtin")]
    pub categories: Vec<Category>,

    /// Compare directory layouts and report structure changes.
    #[builder(default = "false")]
    #[serde(default)]
    pub structure_sync: bool,

    /// Re-download every remote file.
    #[builder(default = "false")]
    #[serde(default)]
    pub force_sync: bool,

    /// The remote requires a bearer token.
    #[builder(default = "false")]
    #[serde(default)]
    pub auth_required: bool,

    /// Bearer token sent with every request.
    #[builder(default, setter(into, strip_option))]
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,

    /// Apply staged changes as soon as all downloads succeeded.
    #[builder(default = "false")]
    #[serde(default)]
    pub auto_apply: bool,

    /// Size of the download worker pool.
    #[builder(default = "4")]
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Minimum time between scheduled syncs, in seconds.
    #[builder(default = "86_400")]
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Where sync state is persisted. Defaults to a file in the staging root.
    #[builder(default, setter(into, strip_option))]
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_sync_interval_secs() -> u64 {
    86_400
}

impl SyncConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let Some(ref metadata_url) = self.metadata_url else {
            return Err("Metadata URL is required".to_string());
        };
        let Some(ref content_root) = self.content_root else {
            return Err("Content root is required".to_string());
        };
        let Some(ref staging_root) = self.staging_root else {
            return Err("Staging root is required".to_string());
        };
        check(
            metadata_url,
            content_root,
            staging_root,
            self.max_concurrent_downloads.unwrap_or(1),
        )
    }
}

fn check(
    metadata_url: &str,
    content_root: &Path,
    staging_root: &Path,
    max_concurrent_downloads: usize,
) -> Result<(), String> {
    if metadata_url.trim().is_empty() {
        return Err("Metadata URL cannot be empty".to_string());
    }
    if content_root.as_os_str().is_empty() {
        return Err("Content root cannot be empty".to_string());
    }
    if staging_root.as_os_str().is_empty() {
        return Err("Staging root cannot be empty".to_string());
    }
    if staging_root.starts_with(content_root) {
        return Err(format!(
            "Staging root {} may not live inside content root {}",
            staging_root.display(),
            content_root.display()
        ));
    }
    if max_concurrent_downloads == 0 {
        return Err("At least one concurrent download is required".to_string());
    }
    Ok(())
}

impl SyncConfig {
    /// Create a new config builder.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Check the same rules the builder enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(
            &self.metadata_url,
            &self.content_root,
            &self.staging_root,
            self.max_concurrent_downloads,
        )
        .map_err(ConfigError::invalid)?;

        for category in &self.categories {
            category.validate().map_err(|err| {
                ConfigError::invalid(format!("category {}: {err}", category.name))
            })?;
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Planner policy derived from this configuration.
    pub fn policy(&self) -> SyncPolicy {
        SyncPolicy {
            compare_structure: self.structure_sync,
            force_sync: self.force_sync,
            disabled_categories: self.disabled_categories(),
        }
    }

    /// Categories currently switched off.
    pub fn disabled_categories(&self) -> Vec<Category> {
        self.categories
            .iter()
            .filter(|c| !c.enabled)
            .cloned()
            .collect()
    }

    /// Whether the named category is known and switched off.
    pub fn is_category_disabled(&self, name: &str) -> bool {
        self.categories
            .iter()
            .any(|c| c.name == name && !c.enabled)
    }

    /// Toggle a category. Returns false if no category has that name.
    pub fn set_category_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.categories.iter_mut().find(|c| c.name == name) {
            Some(category) => {
                category.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Resolved location of the persisted sync state.
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.staging_root.join(STATE_FILE_NAME))
    }
}

/// Configuration for scanning a local directory.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ScanConfig {
    /// Root path to scan.
    pub root: PathBuf,

    /// Follow symbolic links instead of recording them.
    #[builder(default = "false")]
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Maximum depth to traverse (None = unlimited).
    #[builder(default)]
    #[serde(default)]
    pub max_depth: Option<u32>,

    /// Glob patterns of names or paths to leave out.
    #[builder(default)]
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Include hidden files (starting with .).
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub include_hidden: bool,
}

fn default_true() -> bool {
    true
}

impl ScanConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(ref root) = self.root {
            if root.as_os_str().is_empty() {
                return Err("Root path cannot be empty".to_string());
            }
        } else {
            return Err("Root path is required".to_string());
        }
        Ok(())
    }
}

impl ScanConfig {
    /// Create a new scan config builder.
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::default()
    }

    /// Create a simple config for scanning a path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            follow_symlinks: false,
            max_depth: None,
            ignore_patterns: Vec::new(),
            include_hidden: true,
        }
    }

    /// Compile the ignore patterns.
    pub fn ignore_matcher(&self) -> CategoryMatcher {
        CategoryMatcher::new(&[Category::new("ignored", self.ignore_patterns.iter().cloned())])
    }

    /// Check if hidden files should be skipped.
    pub fn should_skip_hidden(&self, name: &str) -> bool {
        !self.include_hidden && name.starts_with('.')
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> SyncConfigBuilder {
        let mut builder = SyncConfig::builder();
        builder
            .metadata_url("https://cdn.example.com/meta.json")
            .content_root("/srv/content")
            .staging_root("/srv/staging");
        builder
    }

    #[test]
    fn test_sync_config_defaults() {
        let config = builder().build().unwrap();
        assert_eq!(config.max_concurrent_downloads, 4);
        assert_eq!(config.sync_interval(), Duration::from_secs(86_400));
        assert!(!config.force_sync);
        assert!(!config.auto_apply);
        assert_eq!(config.categories.len(), 2);
        assert_eq!(
            config.state_path(),
            PathBuf::from("/srv/staging").join(STATE_FILE_NAME)
        );
    }

    #[test]
    fn test_staging_inside_content_rejected() {
        let err = builder()
            .staging_root("/srv/content/.staging")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("may not live inside"));
    }

    #[test]
    fn test_missing_metadata_url() {
        let err = SyncConfig::builder()
            .content_root("/a")
            .staging_root("/b")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Metadata URL"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(builder().max_concurrent_downloads(0usize).build().is_err());
    }

    #[test]
    fn test_category_toggles() {
        let mut config = builder().build().unwrap();
        assert!(!config.is_category_disabled("video"));
        assert!(config.set_category_enabled("video", false));
        assert!(config.is_category_disabled("video"));
        assert!(!config.set_category_enabled("audio", false));

        let policy = config.policy();
        assert_eq!(policy.disabled_categories.len(), 1);
        assert_eq!(policy.disabled_categories[0].name, "video");
    }

    #[test]
    fn test_from_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            metadata_url = "https://cdn.example.com/meta.json"
            content_root = "/srv/content"
            staging_root = "/srv/staging"
            structure_sync = true
            max_concurrent_downloads = 8

            [[categories]]
            name = "video"
            patterns = ["*.mp4"]
            enabled = false
            "#,
        )
        .unwrap();

        assert!(config.structure_sync);
        assert_eq!(config.max_concurrent_downloads, 8);
        assert!(config.is_category_disabled("video"));
        assert!(config.policy().compare_structure);
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = SyncConfig::from_toml_str(
            r#"
            metadata_url = ""
            content_root = "/a"
            staging_root = "/b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_scan_config_ignore() {
        let config = ScanConfig::builder()
            .root("/test")
            .ignore_patterns(vec!["*.part".to_string()])
            .build()
            .unwrap();

        let matcher = config.ignore_matcher();
        assert!(matcher.matches("a/b.part", "b.part"));
        assert!(!matcher.matches("a/b.txt", "b.txt"));
        assert!(!config.should_skip_hidden(".hidden"));
    }
}
