//! deskbridge configuration file handling
//!
//! Loads and manages the ~/.config/deskbridge/config.yaml file with one
//! section per bug-tracker backend.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default poll interval (30 minutes)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1800;

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_page_limit() -> u32 {
    50
}

/// Redmine backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedmineConfig {
    /// Base URL of the Redmine instance
    pub url: String,

    /// Environment variable holding the API key (e.g. "$REDMINE_API_KEY")
    pub api_key_env: Option<String>,

    /// Target project identifier
    pub project_id: String,

    /// Page size for "changed since" listings
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

/// Zendesk backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZendeskConfig {
    /// Base URL of the Zendesk instance
    pub url: String,

    /// Environment variable holding the API token
    pub token_env: Option<String>,

    /// Group the escalated tickets are routed to
    pub group_id: String,
}

/// Pivot backend configuration (asynchronous message exchange)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotConfig {
    /// URL of the message exchange endpoint
    pub exchange_url: String,

    /// Environment variable holding the exchange credential
    pub token_env: Option<String>,

    /// Academy identifier carried in every pivot payload
    pub academy: String,
}

/// deskbridge configuration
///
/// Represents the complete ~/.config/deskbridge/config.yaml file. Exactly one
/// backend section is expected to be active; configuring several is allowed
/// and the `backend` field selects which one the daemon drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Active backend name ("redmine", "zendesk", "pivot")
    pub backend: String,

    /// Path to the local SQLite store
    pub db_path: PathBuf,

    /// Directory for the filesystem object store
    pub object_store_dir: PathBuf,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub redmine: Option<RedmineConfig>,

    #[serde(default)]
    pub zendesk: Option<ZendeskConfig>,

    #[serde(default)]
    pub pivot: Option<PivotConfig>,
}

impl BridgeConfig {
    /// Load configuration from the default path (~/.config/deskbridge/config.yaml)
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::BridgeError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading deskbridge configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            backend = %config.backend,
            poll_interval_secs = config.poll_interval_secs,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/deskbridge/config.yaml)
    pub fn default_path() -> PathBuf {
        // Always use ~/.config for consistency across platforms (macOS, Linux)
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("deskbridge");
        path.push("config.yaml");
        path
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let mut base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        base.push(".config");
        base.push("deskbridge");

        Self {
            backend: "redmine".to_string(),
            db_path: base.join("bridge.db"),
            object_store_dir: base.join("objects"),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            redmine: None,
            zendesk: None,
            pivot: None,
        }
    }
}

/// Resolve a credential from the environment variable named in the config
///
/// Accepts both "$VAR" and "VAR" spellings.
pub(crate) fn resolve_env_credential(env_name: &Option<String>) -> Option<String> {
    env_name
        .as_ref()
        .and_then(|name| std::env::var(name.trim_start_matches('$')).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.backend, "redmine");
        assert_eq!(config.poll_interval_secs, 1800);
        assert!(config.redmine.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();

        let mut config = BridgeConfig::default();
        config.redmine = Some(RedmineConfig {
            url: "https://redmine.example.com".to_string(),
            api_key_env: Some("REDMINE_API_KEY".to_string()),
            project_id: "helpdesk".to_string(),
            page_limit: 25,
        });

        config.save(temp_file.path()).unwrap();

        let loaded = BridgeConfig::load(temp_file.path()).unwrap();
        assert_eq!(loaded.backend, "redmine");
        let redmine = loaded.redmine.unwrap();
        assert_eq!(redmine.project_id, "helpdesk");
        assert_eq!(redmine.page_limit, 25);
    }

    #[test]
    fn test_load_missing_file() {
        let result = BridgeConfig::load("/nonexistent/config.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_default_path() {
        let path = BridgeConfig::default_path();
        assert!(path.ends_with("deskbridge/config.yaml"));
    }

    #[test]
    fn test_page_limit_defaults() {
        let yaml = r#"
backend: redmine
db_path: /tmp/bridge.db
object_store_dir: /tmp/objects
redmine:
  url: https://redmine.example.com
  project_id: helpdesk
"#;
        let config: BridgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.redmine.unwrap().page_limit, 50);
    }
}
