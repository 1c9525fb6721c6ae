use bytes::Bytes;
use rama::http::{Body, Response, StatusCode};
use serde_json::json;
use tracing::{debug, info};

use super::{
    response,
    types::{CacheStatus, RequestContext},
};
use crate::{
    auth::{Credentials, TokenStore},
    cache::{MetadataCache, PackageLookup, TarballCache, TarballLookup},
    config::CacheConfig,
    error::{ProxyError, ProxyResult},
    publish::{self, PublishDecision},
    registry::PackageDocument,
    rewrite::rewrite_tarball_hosts,
    upstream::Registry,
};
use elephant_adapter::TokenBackend;

/// Where rewritten tarball URLs should point.
pub struct HostPair<'a> {
    pub upstream: &'a str,
    pub public: &'a str,
}

/// GET /:name
pub async fn package_metadata<R: Registry>(
    cache: &MetadataCache<R>,
    config: &CacheConfig,
    name: &str,
    validator: Option<&str>,
    hosts: HostPair<'_>,
    ctx: &mut RequestContext,
) -> ProxyResult<Response<Body>> {
    match cache.get(name, validator).await? {
        PackageLookup::Fresh(metadata) => {
            ctx.cache = CacheStatus::Fresh;
            let document = rewrite_tarball_hosts(&metadata.document, hosts.upstream, hosts.public);
            Ok(response::respond_document(
                &document,
                &metadata.etag,
                &config.package_cache_control(),
            )?)
        }
        PackageLookup::NotModified => {
            ctx.cache = CacheStatus::NotModified;
            Ok(response::respond_not_modified(validator)?)
        }
        PackageLookup::NotFound => {
            ctx.cache = CacheStatus::NotFound;
            Ok(response::respond_error(
                StatusCode::NOT_FOUND,
                "package not found",
            )?)
        }
    }
}

/// GET /:name/-/:filename
pub async fn tarball<R: Registry>(
    cache: &TarballCache<R>,
    config: &CacheConfig,
    name: &str,
    filename: &str,
    ctx: &mut RequestContext,
) -> ProxyResult<Response<Body>> {
    match cache.get(name, filename).await? {
        TarballLookup::Found(tarball) => {
            ctx.cache = CacheStatus::Fresh;
            Ok(response::respond_tarball(
                tarball,
                &config.tarball_cache_control(),
            )?)
        }
        TarballLookup::NotFound => {
            ctx.cache = CacheStatus::NotFound;
            Ok(response::respond_error(
                StatusCode::NOT_FOUND,
                "no tarball found",
            )?)
        }
    }
}

/// PUT /-/user/:user
pub async fn login<B: TokenBackend>(
    tokens: &TokenStore<B>,
    body: &Bytes,
) -> ProxyResult<Response<Body>> {
    let credentials: Credentials = serde_json::from_slice(body)
        .map_err(|err| ProxyError::bad_request(format!("invalid login body: {err}")))?;
    let token = tokens.authenticate(&credentials).await?;
    Ok(response::respond_json(
        StatusCode::CREATED,
        &json!({ "ok": true, "token": token }),
    )?)
}

/// GET /-/whoami
pub fn whoami(username: &str) -> ProxyResult<Response<Body>> {
    Ok(response::respond_json(
        StatusCode::OK,
        &json!({ "username": username }),
    )?)
}

/// DELETE /-/user/token/:token
///
/// Only the owner of a token may revoke it.
pub async fn logout<B: TokenBackend>(
    tokens: &TokenStore<B>,
    username: &str,
    token: &str,
) -> ProxyResult<Response<Body>> {
    let owner = match tokens.find_by_token(token).await {
        Ok(owner) => Some(owner),
        Err(ProxyError::Unauthorized) => None,
        Err(err) => return Err(err),
    };
    if owner.as_deref() != Some(username) {
        return Ok(response::respond_error(
            StatusCode::NOT_FOUND,
            "token not found",
        )?);
    }

    tokens.revoke(token).await?;
    Ok(response::respond_json(StatusCode::OK, &json!({ "ok": true }))?)
}

/// PUT /:name
///
/// Runs the version conflict check against the current upstream document.
/// Accepted documents are not stored.
pub async fn publish<R: Registry>(
    cache: &MetadataCache<R>,
    name: &str,
    body: &Bytes,
    username: &str,
) -> ProxyResult<Response<Body>> {
    let proposed = PackageDocument::from_slice(body)
        .map_err(|err| ProxyError::bad_request(format!("invalid package document: {err}")))?;
    if let Some(declared) = proposed.name.as_deref()
        && declared != name
    {
        return Err(ProxyError::bad_request(format!(
            "document name {declared} does not match {name}"
        )));
    }

    let existing = match cache.get(name, None).await? {
        PackageLookup::Fresh(metadata) => Some(metadata),
        PackageLookup::NotModified | PackageLookup::NotFound => None,
    };

    match publish::check(existing.as_ref().map(|m| &m.document), &proposed)? {
        PublishDecision::Conflict => {
            debug!(package = %name, user = %username, "publish rejected: version exists");
            Ok(response::respond_error(
                StatusCode::CONFLICT,
                "this version already present",
            )?)
        }
        PublishDecision::Accept => {
            info!(
                package = %name,
                version = proposed.latest().unwrap_or_default(),
                user = %username,
                "publish accepted"
            );
            Ok(response::respond_json(
                StatusCode::ACCEPTED,
                &json!({ "ok": true, "persisted": false }),
            )?)
        }
    }
}
