mod handlers;
mod response;
mod types;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use elephant_adapter::{AnyTokenBackend, FilesystemStorage, TokenBackend};
use rama::{
    Service,
    error::BoxError,
    http::{Body, HeaderMap, Request, Response, StatusCode, body::util::BodyExt, header},
};
use tracing::{error, info, warn};

use crate::{
    auth::TokenStore,
    cache::{MetadataCache, TarballCache},
    config::Config,
    error::{ProxyError, ProxyResult},
    rewrite::is_valid_public_host,
    upstream::{Registry, UpstreamClient},
};

pub use types::{CacheStatus, RequestContext, Route};

/// The registry proxy service: dispatches each request to the caches, the
/// token store and the publish check.
pub struct ElephantProxy<R = UpstreamClient, B = AnyTokenBackend> {
    config: Arc<Config>,
    metadata: Arc<MetadataCache<R>>,
    tarballs: Arc<TarballCache<R>>,
    tokens: Arc<TokenStore<B>>,
    upstream_host: String,
}

impl<R, B> Clone for ElephantProxy<R, B> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            metadata: Arc::clone(&self.metadata),
            tarballs: Arc::clone(&self.tarballs),
            tokens: Arc::clone(&self.tokens),
            upstream_host: self.upstream_host.clone(),
        }
    }
}

impl<R: Registry, B: TokenBackend> ElephantProxy<R, B> {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<R>,
        storage: Arc<FilesystemStorage>,
        tokens: TokenStore<B>,
    ) -> Self {
        let metadata = MetadataCache::new(
            Arc::clone(&registry),
            config.cache.package_max_age(),
            config.cache.stale_if_error,
        );
        let tarballs = TarballCache::new(registry, storage);
        let upstream_host = config.upstream.authority();

        Self {
            config,
            metadata: Arc::new(metadata),
            tarballs: Arc::new(tarballs),
            tokens: Arc::new(tokens),
            upstream_host,
        }
    }

    async fn handle(&self, req: Request<Body>, ctx: &mut RequestContext) -> Result<Response<Body>> {
        let route = Route::resolve(req.method(), req.uri().path());

        if route.requires_auth() {
            match self.authenticate(req.headers()).await {
                Ok(username) => ctx.user = Some(username),
                Err(err) => {
                    ctx.cache = CacheStatus::Pass;
                    return match err {
                        AuthFailure::Missing => response::respond_error(
                            StatusCode::UNAUTHORIZED,
                            "no credentials provided",
                        ),
                        AuthFailure::Rejected(err) => response::respond_proxy_error(&err),
                    };
                }
            }
        }

        match self.dispatch(route, req, ctx).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                ctx.cache = CacheStatus::Error;
                match &err {
                    ProxyError::Storage(source) => {
                        error!(summary = %ctx.summary(), error = ?source, "storage failure")
                    }
                    ProxyError::UpstreamUnavailable(_) => {
                        warn!(summary = %ctx.summary(), error = %err, "upstream failure")
                    }
                    _ => {}
                }
                response::respond_proxy_error(&err)
            }
        }
    }

    async fn dispatch(
        &self,
        route: Route,
        req: Request<Body>,
        ctx: &mut RequestContext,
    ) -> ProxyResult<Response<Body>> {
        let username = ctx.user.clone().unwrap_or_default();
        match route {
            Route::Homepage => Ok(response::respond_homepage(&self.config)?),
            Route::Ping => Ok(response::respond_json(StatusCode::OK, &serde_json::json!({}))?),
            Route::Metadata { name } => {
                let validator = header_str(req.headers(), header::IF_NONE_MATCH);
                let public_host = self.public_host(&req);
                handlers::package_metadata(
                    &self.metadata,
                    &self.config.cache,
                    &name,
                    validator,
                    handlers::HostPair {
                        upstream: &self.upstream_host,
                        public: &public_host,
                    },
                    ctx,
                )
                .await
            }
            Route::Tarball { name, filename } => {
                handlers::tarball(&self.tarballs, &self.config.cache, &name, &filename, ctx).await
            }
            Route::Login => {
                let body = read_body(req).await?;
                handlers::login(&self.tokens, &body).await
            }
            Route::Whoami => handlers::whoami(&username),
            Route::Logout { token } => handlers::logout(&self.tokens, &username, &token).await,
            Route::Publish { name } => {
                let body = read_body(req).await?;
                handlers::publish(&self.metadata, &name, &body, &username).await
            }
            Route::Unsupported => Ok(response::respond_error(
                StatusCode::NOT_FOUND,
                "unsupported registry call",
            )?),
        }
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthFailure> {
        let value = header_str(headers, header::AUTHORIZATION).ok_or(AuthFailure::Missing)?;
        let token = match value.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
            _ => return Err(AuthFailure::Rejected(ProxyError::Unauthorized)),
        };
        self.tokens
            .find_by_token(token)
            .await
            .map_err(AuthFailure::Rejected)
    }

    /// Host clients should use for tarballs: the request's own host when it is
    /// usable, otherwise the configured one.
    fn public_host(&self, req: &Request<Body>) -> String {
        header_str(req.headers(), header::HOST)
            .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
            .filter(|host| is_valid_public_host(host))
            .map(str::to_string)
            .unwrap_or_else(|| self.config.server.fallback_public_host())
    }
}

enum AuthFailure {
    Missing,
    Rejected(ProxyError),
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn read_body(req: Request<Body>) -> ProxyResult<Bytes> {
    let collected = req
        .into_body()
        .collect()
        .await
        .map_err(|err| anyhow!("reading request body: {err}"))?;
    Ok(collected.to_bytes())
}

impl<R, B> Service<Request<Body>> for ElephantProxy<R, B>
where
    R: Registry + 'static,
    B: TokenBackend + 'static,
{
    type Output = Response<Body>;
    type Error = BoxError;

    async fn serve(&self, req: Request<Body>) -> Result<Self::Output, Self::Error> {
        let mut ctx = RequestContext::from_request(&req);

        let result = self.handle(req, &mut ctx).await;

        match &result {
            Ok(resp) => {
                let response_code = resp.status().as_u16();
                let duration_ms = ctx.start.elapsed().as_millis();
                info!(
                    summary = %ctx.summary(),
                    response_code,
                    duration_ms,
                    cache_status = %ctx.cache,
                    user = ctx.user.as_deref().unwrap_or("-"),
                    "request handled"
                );
            }
            Err(err) => {
                let duration_ms = ctx.start.elapsed().as_millis();
                error!(
                    summary = %ctx.summary(),
                    duration_ms,
                    cache_status = %ctx.cache,
                    error = %err,
                    "request failed"
                );
            }
        }

        result.map_err(|e| e.into())
    }
}
