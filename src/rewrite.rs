//! Tarball URL host rewriting.
//!
//! Cached documents always keep the upstream URLs; the rewrite produces a new
//! document per response, so each request may use its own public host.

use url::{Position, Url};

use crate::registry::{Dist, PackageDocument};

/// Returns a copy of `document` whose tarball URLs on `upstream_host` point at
/// `public_host` instead. Scheme, path and query are preserved; URLs on any
/// other host are left alone, which makes the rewrite safe to re-apply.
pub fn rewrite_tarball_hosts(
    document: &PackageDocument,
    upstream_host: &str,
    public_host: &str,
) -> PackageDocument {
    let mut rewritten = document.clone();
    let dists = rewritten
        .versions
        .values_mut()
        .filter_map(|version| version.dist.as_mut())
        .chain(rewritten.dist.as_mut());

    for dist in dists {
        rewrite_dist(dist, upstream_host, public_host);
    }
    rewritten
}

fn rewrite_dist(dist: &mut Dist, upstream_host: &str, public_host: &str) {
    if let Some(tarball) = dist.tarball.as_mut()
        && let Some(url) = rewrite_url(tarball, upstream_host, public_host)
    {
        *tarball = url;
    }
}

fn rewrite_url(raw: &str, upstream_host: &str, public_host: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    if !authority(&url).eq_ignore_ascii_case(upstream_host)
        || public_host.eq_ignore_ascii_case(upstream_host)
    {
        return None;
    }
    Some(format!(
        "{}://{}{}",
        url.scheme(),
        public_host,
        &url[Position::BeforePath..]
    ))
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Whether a client-supplied `Host` value is usable as a URL authority.
pub fn is_valid_public_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 255
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']' | '_'))
}
