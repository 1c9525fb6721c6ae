use std::{future::Future, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use breaker_machines::CircuitBreaker;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{
    Client, StatusCode,
    header::{ACCEPT, ETAG, HeaderMap, HeaderValue, IF_NONE_MATCH, USER_AGENT},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::UpstreamConfig,
    error::{ProxyError, ProxyResult},
    registry::{PackageDocument, PackageMetadata},
};

const UA: &str = concat!("elephant/", env!("CARGO_PKG_VERSION"));
const NPM_JSON: &str = "application/json";

/// Outcome of a (possibly conditional) metadata fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageFetch {
    Modified(PackageMetadata),
    /// Upstream answered 304 to the validator we sent.
    NotModified,
    NotFound,
}

/// The upstream registry protocol consumed by both caches.
// Uses explicit `impl Future + Send` so caches stay generic without boxing.
pub trait Registry: Send + Sync {
    fn fetch_package(
        &self,
        name: &str,
        validator: Option<&str>,
    ) -> impl Future<Output = ProxyResult<PackageFetch>> + Send;

    /// `Ok(None)` when upstream has no such tarball.
    fn fetch_tarball(
        &self,
        name: &str,
        filename: &str,
    ) -> impl Future<Output = ProxyResult<Option<Bytes>>> + Send;
}

/// reqwest-based upstream client with a timeout on every call and an
/// optional circuit breaker. It never retries.
#[derive(Clone)]
pub struct UpstreamClient {
    base: Url,
    client: Client,
    breaker: Option<Arc<Mutex<CircuitBreaker>>>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(UA)
            .build()
            .context("building upstream http client")?;

        // Open after 5 failures in 60s, probe again after 30s
        let breaker = config.circuit_breaker.then(|| {
            let breaker = CircuitBreaker::builder("npm_upstream")
                .failure_threshold(5)
                .failure_window_secs(60.0)
                .half_open_timeout_secs(30.0)
                .success_threshold(2)
                .jitter_factor(0.1)
                .on_open(|name| {
                    warn!(circuit = %name, "Circuit breaker opened - upstream is failing");
                })
                .on_close(|name| {
                    info!(circuit = %name, "Circuit breaker closed - upstream recovered");
                })
                .on_half_open(|name| {
                    info!(circuit = %name, "Circuit breaker half-open - testing upstream");
                })
                .build();
            Arc::new(Mutex::new(breaker))
        });

        info!(
            upstream = %config.url,
            timeout_secs = config.timeout_secs,
            circuit_breaker = config.circuit_breaker,
            "Upstream client initialized"
        );

        Ok(Self {
            base: config.url.clone(),
            client,
            breaker,
        })
    }

    /// `{base}/{name}` with the scope separator encoded (`@scope%2fname`).
    pub fn package_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_str(), name.replace('/', "%2f"))
    }

    /// `{base}/{name}/-/{filename}`
    pub fn tarball_url(&self, name: &str, filename: &str) -> String {
        format!("{}/{}/-/{}", self.base_str(), name, filename)
    }

    fn base_str(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    async fn get(&self, url: &str, headers: HeaderMap) -> ProxyResult<reqwest::Response> {
        if let Some(breaker) = &self.breaker
            && breaker.lock().is_open()
        {
            return Err(ProxyError::upstream(
                "circuit breaker is open - upstream is currently unavailable",
            ));
        }

        let started = Instant::now();
        let result = self.client.get(url).headers(headers).send().await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(response) => {
                let status = response.status();
                debug!(%url, %status, duration, "upstream responded");
                if let Some(breaker) = &self.breaker {
                    let mut breaker = breaker.lock();
                    if status.is_server_error() {
                        breaker.record_failure(duration);
                        breaker.check_and_trip();
                    } else {
                        breaker.record_success(duration);
                    }
                }
                Ok(response)
            }
            Err(err) => {
                if let Some(breaker) = &self.breaker {
                    let mut breaker = breaker.lock();
                    breaker.record_failure(duration);
                    breaker.check_and_trip();
                }
                let reason = if err.is_timeout() { "timed out" } else { "failed" };
                warn!(%url, error = %err, "upstream request {reason}");
                Err(ProxyError::upstream(format!("upstream request {reason}: {err}")))
            }
        }
    }
}

impl Registry for UpstreamClient {
    async fn fetch_package(&self, name: &str, validator: Option<&str>) -> ProxyResult<PackageFetch> {
        let url = self.package_url(name);
        let response = self.get(&url, conditional_headers(validator)).await?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(PackageFetch::NotModified),
            StatusCode::NOT_FOUND => Ok(PackageFetch::NotFound),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response
                    .bytes()
                    .await
                    .map_err(|err| ProxyError::upstream(format!("reading metadata body: {err}")))?;
                let document = PackageDocument::from_slice(&body)
                    .map_err(|err| ProxyError::upstream(format!("bad uplink payload: {err}")))?;
                Ok(PackageFetch::Modified(PackageMetadata::new(
                    document, etag, &body,
                )))
            }
            status => Err(ProxyError::upstream(format!(
                "{url} returned unexpected status {status}"
            ))),
        }
    }

    async fn fetch_tarball(&self, name: &str, filename: &str) -> ProxyResult<Option<Bytes>> {
        let url = self.tarball_url(name, filename);
        let response = self.get(&url, HeaderMap::new()).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .bytes()
                .await
                .map(Some)
                .map_err(|err| ProxyError::upstream(format!("reading tarball body: {err}"))),
            status => Err(ProxyError::upstream(format!(
                "{url} returned unexpected status {status}"
            ))),
        }
    }
}

fn conditional_headers(validator: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(NPM_JSON));
    headers.insert(USER_AGENT, HeaderValue::from_static(UA));
    if let Some(validator) = validator
        && let Ok(value) = HeaderValue::from_str(validator)
    {
        headers.insert(IF_NONE_MATCH, value);
    }
    headers
}
