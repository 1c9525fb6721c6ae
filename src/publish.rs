use crate::{
    error::{ProxyError, ProxyResult},
    registry::PackageDocument,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishDecision {
    Accept,
    Conflict,
}

/// Rejects a publish whose `dist-tags.latest` is already a published version.
///
/// Nothing beyond that is checked: no semver ordering, no merging, no storage.
pub fn check(
    existing: Option<&PackageDocument>,
    proposed: &PackageDocument,
) -> ProxyResult<PublishDecision> {
    let latest = proposed
        .latest()
        .ok_or_else(|| ProxyError::bad_request("publish is missing dist-tags.latest"))?;

    let taken = existing.is_some_and(|document| document.has_version(latest));
    Ok(if taken {
        PublishDecision::Conflict
    } else {
        PublishDecision::Accept
    })
}
