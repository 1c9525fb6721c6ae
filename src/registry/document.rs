use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// A package metadata document ("packument").
///
/// Only the fields the proxy reasons about are typed; everything else is
/// carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionDescriptor>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    /// Present on single-version documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<Dist>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<Dist>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl PackageDocument {
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Version pointed at by `dist-tags.latest`.
    pub fn latest(&self) -> Option<&str> {
        self.dist_tags.get("latest").map(String::as_str)
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }
}

/// The canonical upstream document for one package and its validator.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageMetadata {
    pub document: PackageDocument,
    pub etag: String,
}

impl PackageMetadata {
    /// Uses the upstream `ETag` when there is one, otherwise derives a weak
    /// validator from the body so every cached entry can be revalidated.
    pub fn new(document: PackageDocument, upstream_etag: Option<String>, body: &[u8]) -> Self {
        let etag = upstream_etag
            .filter(|tag| !tag.trim().is_empty())
            .unwrap_or_else(|| weak_etag(body));
        Self { document, etag }
    }
}

fn weak_etag(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("W/\"{}\"", hex::encode(hasher.finalize()))
}
