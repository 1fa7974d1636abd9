//! App configuration: `canopy.toml` plus environment overrides.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::DEFAULT_CONTEXT_FILE;
use crate::error::{CoreError, CoreResult};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "canopy.toml";

/// Default directory for the cloud assembly.
pub const DEFAULT_OUTPUT_DIR: &str = "canopy.out";

pub const ENV_ACCOUNT: &str = "ACCOUNT";
pub const ENV_REGION: &str = "REGION";
pub const ENV_CONTEXT_FILE: &str = "CONTEXT_FILE";
pub const ENV_DEBUG: &str = "DEBUG";

/// Settings shared by every stack in an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where synthesized templates are written.
    pub output_dir: PathBuf,
    /// Context cache file.
    pub context_file: PathBuf,
    /// Account for stacks that do not name one.
    pub account: Option<String>,
    /// Region for stacks that do not name one.
    pub region: Option<String>,
    /// Feature flag values below any construct context.
    pub flags: BTreeMap<String, bool>,
    /// Verbose diagnostics.
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            context_file: PathBuf::from(DEFAULT_CONTEXT_FILE),
            account: None,
            region: None,
            flags: BTreeMap::new(),
            debug: false,
        }
    }
}

impl AppConfig {
    /// Parse a TOML configuration.
    pub fn from_toml(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load a configuration file if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> CoreResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from an environment lookup function.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(account) = lookup(ENV_ACCOUNT).filter(|v| !v.is_empty()) {
            self.account = Some(account);
        }
        if let Some(region) = lookup(ENV_REGION).filter(|v| !v.is_empty()) {
            self.region = Some(region);
        }
        if let Some(file) = lookup(ENV_CONTEXT_FILE).filter(|v| !v.is_empty()) {
            self.context_file = PathBuf::from(file);
        }
        if lookup(ENV_DEBUG).is_some() {
            self.debug = true;
        }
        self
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.flags.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.context_file, PathBuf::from(".context-cache.json"));
        assert_eq!(config.output_dir, PathBuf::from("canopy.out"));
        assert!(config.account.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config = AppConfig::from_toml(
            r#"
output_dir = "build"
account = "111111111111"
region = "eu-west-1"

[flags]
"@canopy/kms:default-key-policies" = true
"#,
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("build"));
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.flags.get("@canopy/kms:default-key-policies"), Some(&true));
        assert_eq!(config.context_file, PathBuf::from(".context-cache.json"));
    }

    #[test]
    fn test_env_overrides_file() {
        let config = AppConfig::default()
            .with_account("111")
            .apply_env(|key| match key {
                "ACCOUNT" => Some("222".to_string()),
                "CONTEXT_FILE" => Some("ctx.json".to_string()),
                "DEBUG" => Some(String::new()),
                _ => None,
            });
        assert_eq!(config.account.as_deref(), Some("222"));
        assert_eq!(config.context_file, PathBuf::from("ctx.json"));
        assert!(config.debug);
        assert!(config.region.is_none());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            AppConfig::from_toml("account = ["),
            Err(CoreError::Config(_))
        ));
    }
}
