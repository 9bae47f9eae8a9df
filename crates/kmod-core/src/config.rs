//! Engine configuration loaded from `<home>/config.toml`.
//!
//! Every field has a default, so an empty or missing file is valid. A few
//! environment variables override the file:
//!
//! | Variable              | Field                  |
//! |-----------------------|------------------------|
//! | `KMOD_HOME`           | `home`                 |
//! | `KMOD_REMOTE_URL`     | `network.remote_url`   |
//! | `KMOD_ALLOW_UNSIGNED` | `trust.allow_unsigned` |
//! | `KMOD_DIGEST`         | `digest`               |

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kmod_schema::DigestAlgorithm;
use serde::{Deserialize, Serialize};

use crate::loader::LoaderSettings;
use crate::paths::{Layout, try_kmod_home};
use crate::retry::RetryPolicy;
use crate::store::{ContentStore, StoreError};
use crate::verifier::TrustPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory. Falls back to `KMOD_HOME`, then `~/.kmod`.
    pub home: Option<PathBuf>,
    /// Algorithm for newly stored blobs.
    pub digest: DigestAlgorithm,
    pub trust: TrustConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub allow_unsigned: bool,
    /// Base64 public keys or key ids.
    pub trusted_keys: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base URL of a read-only blob mirror.
    pub remote_url: Option<String>,
    pub remote_timeout_secs: u64,
    pub registry_timeout_secs: u64,
    pub max_parallel_fetches: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote_timeout_secs: 30,
            registry_timeout_secs: 10,
            max_parallel_fetches: 8,
            retry_attempts: 1,
            retry_backoff_ms: 250,
        }
    }
}

impl Config {
    /// Load `config.toml` from the default home, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let home = try_kmod_home().context("Could not determine module home directory")?;
        let path = Layout::new(&home).config();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.home.get_or_insert(home);
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(home) = lookup("KMOD_HOME") {
            self.home = Some(PathBuf::from(home));
        }
        if let Some(url) = lookup("KMOD_REMOTE_URL") {
            self.network.remote_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(flag) = lookup("KMOD_ALLOW_UNSIGNED") {
            self.trust.allow_unsigned = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(algo) = lookup("KMOD_DIGEST") {
            self.digest = algo
                .parse()
                .with_context(|| format!("Invalid KMOD_DIGEST value '{algo}'"))?;
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        let home = self
            .home
            .clone()
            .or_else(try_kmod_home)
            .unwrap_or_else(|| PathBuf::from(".kmod"));
        Layout::new(home)
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy {
            allow_unsigned: self.trust.allow_unsigned,
            trusted_keys: self.trust.trusted_keys.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.network.retry_attempts,
            Duration::from_millis(self.network.retry_backoff_ms),
        )
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.network.remote_timeout_secs)
    }

    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            retry: self.retry_policy(),
            max_parallel_fetches: self.network.max_parallel_fetches.max(1),
            registry_timeout: Duration::from_secs(self.network.registry_timeout_secs),
        }
    }

    /// The configured blob mirror, if any.
    pub fn remote_store(&self) -> Result<Option<Arc<dyn ContentStore>>, StoreError> {
        let Some(url) = self.network.remote_url.as_deref() else {
            return Ok(None);
        };
        #[cfg(feature = "network")]
        {
            let store = crate::store::HttpStore::new(url, self.remote_timeout(), self.digest)?;
            Ok(Some(Arc::new(store)))
        }
        #[cfg(not(feature = "network"))]
        {
            tracing::warn!(url, "Remote mirror configured but network support is disabled");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.digest, DigestAlgorithm::Sha256);
        assert!(!config.trust.allow_unsigned);
        assert_eq!(config.loader_settings().max_parallel_fetches, 8);
        assert_eq!(config.retry_policy().max_attempts, 1);
    }

    #[test]
    fn parses_sections() {
        let config = Config::from_toml_str(
            r#"
            home = "/srv/kmod"
            digest = "blake3"

            [trust]
            allow_unsigned = true
            trusted_keys = ["abcd1234"]

            [network]
            remote_url = "https://mirror.example.com"
            retry_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.layout().home(), Path::new("/srv/kmod"));
        assert_eq!(config.digest, DigestAlgorithm::Blake3);
        assert!(config.trust_policy().allow_unsigned);
        assert!(config.trust_policy().trusted_keys.contains("abcd1234"));
        assert_eq!(config.retry_policy().max_attempts, 3);
        // Unset keys keep their defaults.
        assert_eq!(config.network.remote_timeout_secs, 30);
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("KMOD_HOME", "/tmp/kmod-test"),
            ("KMOD_ALLOW_UNSIGNED", "true"),
            ("KMOD_DIGEST", "blake3"),
            ("KMOD_REMOTE_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::from_toml_str(
            r#"
            home = "/srv/kmod"
            [network]
            remote_url = "https://mirror.example.com"
            "#,
        )
        .unwrap();
        config
            .apply_overrides(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.layout().home(), Path::new("/tmp/kmod-test"));
        assert!(config.trust.allow_unsigned);
        assert_eq!(config.digest, DigestAlgorithm::Blake3);
        assert_eq!(config.network.remote_url, None);
    }

    #[test]
    fn bad_digest_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "KMOD_DIGEST").then(|| "md5".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("KMOD_DIGEST"));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "digest = [").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }
}
