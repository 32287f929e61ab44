//! dispatchd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::domain::IdentityConfig;
use crate::engine::EngineConfig;

/// Main dispatchd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tick, lease and worker timing
    pub engine: EngineConfig,

    /// State store backend
    pub storage: StorageConfig,

    /// Chat transport
    pub transport: TransportConfig,

    /// Identities this process may lease
    pub identities: Vec<IdentityConfig>,
}

impl Config {
    /// Reject settings the engine, limiter or transport can't run with
    ///
    /// Run on every load, so admin commands fail on the same mistakes as
    /// `run` does.
    pub fn check(&self) -> Result<()> {
        self.engine.validate()?;

        let mut seen = HashSet::new();
        for identity in &self.identities {
            identity.validate()?;
            if !seen.insert(identity.identity_id.as_str()) {
                return Err(eyre::eyre!("identity '{}' is listed twice", identity.identity_id));
            }
        }

        if self.transport.kind == TransportKind::Webhook {
            if self.transport.base_url.is_empty() {
                return Err(eyre::eyre!("transport.base-url is required for the webhook transport"));
            }
            let url = reqwest::Url::parse(&self.transport.base_url)
                .with_context(|| format!("transport.base-url '{}' is not a URL", self.transport.base_url))?;
            if url.cannot_be_a_base() {
                return Err(eyre::eyre!("transport.base-url '{}' cannot take a path", url));
            }
        }
        Ok(())
    }

    /// The webhook bearer token must be present before the scheduler starts
    pub fn check_credentials(&self) -> Result<()> {
        if self.transport.kind == TransportKind::Webhook
            && let Some(var) = &self.transport.token_env
            && std::env::var(var).is_err()
        {
            return Err(eyre::eyre!("Transport token not found. Set the {} environment variable.", var));
        }
        Ok(())
    }

    /// Look up a configured identity
    pub fn identity(&self, identity_id: &str) -> Option<&IdentityConfig> {
        self.identities.iter().find(|i| i.identity_id == identity_id)
    }

    /// Load and check the configuration
    ///
    /// An explicit path must exist. Otherwise `.dispatchd.yml` in the working
    /// directory, then `dispatchd/dispatchd.yml` under the user config
    /// directory; built-in defaults when neither is present.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let (config, source) = match config_path {
            Some(path) => {
                let config = Self::load_from_file(path)
                    .with_context(|| format!("Failed to load config from {}", path.display()))?;
                (config, Some(path.clone()))
            }
            None => Self::discover(),
        };

        let origin = source
            .as_ref()
            .map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string());
        config
            .check()
            .with_context(|| format!("Invalid configuration in {}", origin))?;

        info!(%origin, identities = config.identities.len(), "Configuration loaded");
        Ok(config)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".dispatchd.yml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("dispatchd").join("dispatchd.yml"));
        }
        paths
    }

    fn discover() -> (Self, Option<PathBuf>) {
        for path in Self::search_paths().into_iter().filter(|p| p.exists()) {
            match Self::load_from_file(&path) {
                Ok(config) => return (config, Some(path)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable config"),
            }
        }
        (Self::default(), None)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        serde_yaml::from_str(&content).context("Failed to parse config file")
    }
}

/// State store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    /// Process-local; state is lost on exit
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// SQLite database file shared by every dispatchd process
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/dispatchd on Linux)
        let path = dirs::data_dir()
            .map(|d| d.join("dispatchd"))
            .unwrap_or_else(|| PathBuf::from(".dispatchd"))
            .join("dispatchd.db");

        Self {
            backend: StorageBackend::Sqlite,
            path,
        }
    }
}

/// Transport implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Webhook,
    /// Accept every send without contacting a provider
    DryRun,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,

    /// Root of the provider's identity endpoints
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Cool-down applied on 429 without a Retry-After header
    #[serde(rename = "default-cooldown-ms")]
    pub default_cooldown_ms: u64,

    /// Environment variable containing the bearer token
    #[serde(rename = "token-env")]
    pub token_env: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Webhook,
            base_url: "http://127.0.0.1:8080".to_string(),
            timeout_ms: 30_000,
            default_cooldown_ms: 60_000,
            token_env: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert!(config.storage.path.ends_with("dispatchd.db"));
        assert_eq!(config.transport.kind, TransportKind::Webhook);
        assert!(config.identities.is_empty());
        assert!(config.check().is_ok());
        assert!(config.check_credentials().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
engine:
  tick-interval-ms: 500
  lease-ttl-ms: 5000

storage:
  backend: sqlite
  path: /var/lib/dispatchd/state.db

transport:
  kind: dry-run
  timeout-ms: 1000

identities:
  - identity-id: bot-a
    rate-limit-capacity: 5
    refill-interval-ms: 60000
    max-attempts: 3
    backoff-base-ms: 1000
    backoff-cap-ms: 60000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.engine.tick_interval_ms, 500);
        assert_eq!(config.engine.poll_interval_ms, 1_000);
        assert_eq!(config.storage.path, PathBuf::from("/var/lib/dispatchd/state.db"));
        assert_eq!(config.transport.kind, TransportKind::DryRun);
        assert_eq!(config.transport.default_cooldown_ms, 60_000);
        assert_eq!(config.identities.len(), 1);
        assert_eq!(config.identity("bot-a").unwrap().rate_limit_capacity, 5);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_identity_fields_are_required() {
        let yaml = r#"
identities:
  - identity-id: bot-a
    rate-limit-capacity: 5
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_check_rejects_duplicates_and_bad_values() {
        let mut config = Config {
            identities: vec![
                IdentityConfig::new("bot-a", 5, 60_000, 3, 1_000, 60_000),
                IdentityConfig::new("bot-a", 5, 60_000, 3, 1_000, 60_000),
            ],
            ..Config::default()
        };
        assert!(config.check().is_err());

        config.identities = vec![IdentityConfig::new("bot-a", 0, 60_000, 3, 1_000, 60_000)];
        assert!(config.check().is_err());

        config.identities.clear();
        config.transport.base_url = "not a url".to_string();
        assert!(config.check().is_err());

        config.transport.base_url = TransportConfig::default().base_url;
        config.engine.lease_ttl_ms = config.engine.tick_interval_ms;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_credentials_require_token_env() {
        let config = Config {
            transport: TransportConfig {
                token_env: Some("DISPATCHD_TEST_TOKEN_THAT_IS_NOT_SET".to_string()),
                ..TransportConfig::default()
            },
            ..Config::default()
        };
        assert!(config.check().is_ok());
        assert!(config.check_credentials().is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storage:\n  backend: memory\n").unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_load_rejects_short_lease_ttl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "engine:\n  tick-interval-ms: 1000\n  lease-ttl-ms: 1500\n").unwrap();

        let err = Config::load(Some(&file.path().to_path_buf())).unwrap_err();
        assert!(err.chain().any(|cause| cause.to_string().contains("lease-ttl-ms")));
    }

    #[test]
    fn test_load_rejects_invalid_identity() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "identities:\n  - identity-id: bot-a\n    rate-limit-capacity: 0\n    refill-interval-ms: 1000\n    max-attempts: 3\n    backoff-base-ms: 100\n    backoff-cap-ms: 1000\n"
        )
        .unwrap();

        let err = Config::load(Some(&file.path().to_path_buf())).unwrap_err();
        assert!(err.chain().any(|cause| cause.to_string().contains("rate-limit-capacity")));
    }

    #[test]
    fn test_load_explicit_path_missing_fails() {
        let path = PathBuf::from("/nonexistent/dispatchd.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
