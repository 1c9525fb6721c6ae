use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Seconds a metadata entry is served without asking upstream again.
    /// Also advertised to clients as `Cache-Control: max-age`.
    #[serde(default = "CacheConfig::default_package_max_age_secs")]
    pub package_max_age_secs: u64,
    /// `Cache-Control: max-age` for tarball responses. Tarballs are immutable.
    #[serde(default = "CacheConfig::default_tarball_max_age_secs")]
    pub tarball_max_age_secs: u64,
    /// Serve a stale metadata entry when revalidation hits an upstream failure.
    #[serde(default)]
    pub stale_if_error: bool,
}

impl CacheConfig {
    fn default_package_max_age_secs() -> u64 {
        300
    }

    fn default_tarball_max_age_secs() -> u64 {
        86_400
    }

    pub fn package_max_age(&self) -> Duration {
        Duration::from_secs(self.package_max_age_secs)
    }

    pub fn package_cache_control(&self) -> String {
        format!("public, max-age={}", self.package_max_age_secs)
    }

    pub fn tarball_cache_control(&self) -> String {
        format!("public, max-age={}", self.tarball_max_age_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            package_max_age_secs: Self::default_package_max_age_secs(),
            tarball_max_age_secs: Self::default_tarball_max_age_secs(),
            stale_if_error: false,
        }
    }
}
