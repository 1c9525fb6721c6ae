use std::time::Duration;

use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: Url,
    /// Whole-request timeout for every upstream call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Fail fast while upstream keeps erroring.
    #[serde(default = "default_circuit_breaker")]
    pub circuit_breaker: bool,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `host[:port]` of the upstream registry, as it appears in tarball URLs.
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_secs: default_timeout_secs(),
            circuit_breaker: default_circuit_breaker(),
        }
    }
}

fn default_upstream_url() -> Url {
    Url::parse("https://registry.npmjs.org/").expect("static upstream url is valid")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_circuit_breaker() -> bool {
    true
}
