use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use argon2::password_hash::PasswordHash;
use serde::Deserialize;

pub mod auth;
pub mod cache;
pub mod logging;
pub mod server;
pub mod storage;
pub mod upstream;

#[cfg(test)]
mod tests;

pub use auth::{AuthConfig, UserEntry};
pub use cache::CacheConfig;
pub use logging::LoggingConfig;
pub use server::ServerConfig;
pub use storage::StorageConfig;
pub use upstream::UpstreamConfig;

pub const DEFAULT_CONFIG_PATH: &str = "elephant.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let candidate = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if candidate.exists() {
            let raw = fs::read_to_string(&candidate)
                .with_context(|| format!("failed to read config {}", candidate.display()))?;
            let mut config = Self::from_toml(&raw)
                .with_context(|| format!("invalid config {}", candidate.display()))?;
            config.normalize_paths(candidate.parent().unwrap_or(Path::new(".")));
            Ok(config)
        } else {
            tracing::warn!(
                path = %candidate.display(),
                "configuration file not found, using defaults"
            );
            let mut config = Config::default();
            let cwd = std::env::current_dir().context("reading current directory")?;
            config.normalize_paths(&cwd);
            Ok(config)
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parsing toml")
    }

    fn normalize_paths(&mut self, base_dir: &Path) {
        self.storage.normalize_paths(base_dir);
        self.auth.normalize_paths(base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        let scheme = self.upstream.url.scheme();
        if scheme != "https" && scheme != "http" {
            bail!("unsupported upstream scheme {}", self.upstream.url);
        }
        if self.upstream.url.host_str().is_none() {
            bail!("upstream url {} has no host", self.upstream.url);
        }
        if self.upstream.timeout_secs == 0 {
            bail!("upstream.timeout_secs must be greater than zero");
        }

        let mut seen = HashSet::new();
        for user in &self.auth.users {
            if user.name.trim().is_empty() {
                bail!("auth.users entries need a non-empty name");
            }
            if !seen.insert(user.name.as_str()) {
                bail!("duplicate auth user {}", user.name);
            }
            PasswordHash::new(&user.password_hash).map_err(|err| {
                anyhow::anyhow!("auth user {} has an invalid password_hash: {err}", user.name)
            })?;
        }
        Ok(())
    }
}
