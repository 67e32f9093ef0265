//! Weaver settings
//!
//! Settings decide which compiled modules the build hook weaves. They are
//! merged from, in order of increasing priority:
//!
//! 1. [`WeaverSettings::default()`]
//! 2. an optional TOML file
//! 3. `TREE_INJECTOR_*` environment variables
//!
//! ```toml
//! log_filter = "tree_injector=debug"
//!
//! [[inclusion_rules]]
//! kind = "exclude_prefixes"
//! prefixes = ["System.", "ThirdParty."]
//!
//! [[inclusion_rules]]
//! kind = "include_prefixes"
//! prefixes = ["Game."]
//! ```

use crate::error::WeaveError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[cfg(feature = "logging")]
use tracing::debug;

/// Module names excluded when no settings override them
pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &["System.", "Microsoft.", "Mono.", "Injection.Weaver"];

/// Environment prefix for settings overrides
pub const ENV_PREFIX: &str = "TREE_INJECTOR_";

/// One predicate over module file names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InclusionRule {
    /// Reject modules whose file name starts with one of the prefixes
    ExcludePrefixes { prefixes: Vec<String> },
    /// Reject modules whose file name starts with none of the prefixes
    IncludePrefixes { prefixes: Vec<String> },
}

impl Default for InclusionRule {
    fn default() -> Self {
        Self::ExcludePrefixes {
            prefixes: DEFAULT_EXCLUDED_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl InclusionRule {
    pub fn is_included(&self, module_path: &Path) -> bool {
        let Some(name) = module_path.file_name().and_then(|name| name.to_str()) else {
            return true;
        };

        match self {
            Self::ExcludePrefixes { prefixes } => !prefixes.iter().any(|p| name.starts_with(p.as_str())),
            Self::IncludePrefixes { prefixes } => prefixes.iter().any(|p| name.starts_with(p.as_str())),
        }
    }
}

/// Persisted weaver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaverSettings {
    /// Extra `EnvFilter` directive for the hook's subscriber, e.g. `tree_injector=debug`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
    /// A module is woven when no rule rejects it
    #[serde(default)]
    pub inclusion_rules: Vec<InclusionRule>,
}

impl Default for WeaverSettings {
    fn default() -> Self {
        Self {
            log_filter: None,
            inclusion_rules: vec![InclusionRule::default()],
        }
    }
}

impl WeaverSettings {
    pub fn is_included(&self, module_path: &Path) -> bool {
        self.inclusion_rules
            .iter()
            .all(|rule| rule.is_included(module_path))
    }
}

/// Loads [`WeaverSettings`] through `figment`
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    path: Option<PathBuf>,
    env_prefix: String,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Read the TOML file at `path` when it exists
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(&self) -> Result<WeaverSettings, WeaveError> {
        let mut figment = Figment::new().merge(Serialized::defaults(WeaverSettings::default()));

        if let Some(path) = &self.path {
            #[cfg(feature = "logging")]
            debug!(target: "tree_injector", path = %path.display(), found = path.exists(), "Loading weaver settings");

            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix));

        figment
            .extract()
            .map_err(|error| WeaveError::Settings(error.to_string()))
    }

    /// Write `settings` as TOML
    pub fn save(settings: &WeaverSettings, path: impl AsRef<Path>) -> Result<(), WeaveError> {
        let content =
            toml::to_string_pretty(settings).map_err(|error| WeaveError::Settings(error.to_string()))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rule_excludes_host_modules() {
        let settings = WeaverSettings::default();
        assert!(!settings.is_included(Path::new("out/System.Runtime.json")));
        assert!(!settings.is_included(Path::new("Injection.Weaver.json")));
        assert!(settings.is_included(Path::new("out/Game.Core.json")));
    }

    #[test]
    fn test_any_rule_can_reject() {
        let settings = WeaverSettings {
            inclusion_rules: vec![
                InclusionRule::default(),
                InclusionRule::IncludePrefixes {
                    prefixes: vec!["Game.".into()],
                },
            ],
            ..WeaverSettings::default()
        };
        assert!(settings.is_included(Path::new("Game.Core.json")));
        assert!(!settings.is_included(Path::new("Tools.Core.json")));
        assert!(
            WeaverSettings {
                inclusion_rules: Vec::new(),
                ..WeaverSettings::default()
            }
            .is_included(Path::new("System.Runtime.json"))
        );
    }

    #[test]
    fn test_load_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weaver.toml");
        let settings = WeaverSettings {
            log_filter: Some("tree_injector=debug".into()),
            inclusion_rules: vec![InclusionRule::IncludePrefixes {
                prefixes: vec!["Game.".into()],
            }],
        };
        SettingsLoader::save(&settings, &path).unwrap();

        let loaded = SettingsLoader::new()
            .with_path(&path)
            .with_env_prefix("TREE_INJECTOR_TEST_UNUSED_")
            .load()
            .unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let loaded = SettingsLoader::new()
            .with_path("/definitely/not/here/weaver.toml")
            .with_env_prefix("TREE_INJECTOR_TEST_UNUSED_")
            .load()
            .unwrap();
        assert_eq!(loaded, WeaverSettings::default());
    }
}
