use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::coalesce::InFlight;
use crate::{
    error::{ProxyError, ProxyResult},
    registry::PackageMetadata,
    upstream::{PackageFetch, Registry},
};

/// Result of a metadata lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageLookup {
    /// Canonical upstream document, not yet rewritten for any host.
    Fresh(Arc<PackageMetadata>),
    /// The client's validator matches the current document.
    NotModified,
    NotFound,
}

/// Outcome of one upstream refresh, handed to every caller that joined it.
type Shared = Result<Option<Arc<PackageMetadata>>, Arc<ProxyError>>;

#[derive(Clone)]
struct Entry {
    metadata: Arc<PackageMetadata>,
    revalidated_at: Instant,
    generation: u64,
}

impl Entry {
    fn is_fresh(&self, max_age: Duration) -> bool {
        self.revalidated_at.elapsed() < max_age
    }
}

/// Read-through cache of package documents keyed by name.
///
/// Entries hold the upstream original with its ETag. A lookup is answered
/// from memory only while the entry is younger than `max_age` and the
/// client's validator (if any) matches; anything else goes upstream with a
/// conditional request. At most one upstream call per name is in flight, and
/// everyone waiting on it gets its outcome, including NotFound and failures.
pub struct MetadataCache<R> {
    registry: Arc<R>,
    entries: RwLock<HashMap<String, Entry>>,
    inflight: InFlight<Shared>,
    generation: AtomicU64,
    max_age: Duration,
    stale_if_error: bool,
}

impl<R: Registry> MetadataCache<R> {
    pub fn new(registry: Arc<R>, max_age: Duration, stale_if_error: bool) -> Self {
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
            inflight: InFlight::new(),
            generation: AtomicU64::new(0),
            max_age,
            stale_if_error,
        }
    }

    pub async fn get(&self, name: &str, validator: Option<&str>) -> ProxyResult<PackageLookup> {
        let seen = match self.entry(name) {
            Some(entry)
                if entry.is_fresh(self.max_age)
                    && validator.is_none_or(|v| v == entry.metadata.etag) =>
            {
                debug!(package = %name, "metadata cache hit");
                return Ok(resolve(&entry.metadata, validator));
            }
            Some(entry) => Some(entry.generation),
            None => None,
        };

        let current = self
            .inflight
            .run(name, || async move { self.refresh(name, seen).await.map_err(Arc::new) })
            .await?;

        Ok(match current {
            Some(metadata) => resolve(&metadata, validator),
            None => PackageLookup::NotFound,
        })
    }

    /// The current document for `name`, or `None` when upstream has no such package.
    async fn refresh(
        &self,
        name: &str,
        seen: Option<u64>,
    ) -> ProxyResult<Option<Arc<PackageMetadata>>> {
        // A call that finished after our first look already refreshed the entry.
        let cached = self.entry(name);
        if let Some(entry) = &cached
            && Some(entry.generation) != seen
            && entry.is_fresh(self.max_age)
        {
            debug!(package = %name, "metadata refreshed by concurrent request");
            return Ok(Some(Arc::clone(&entry.metadata)));
        }

        let known_etag = cached.as_ref().map(|entry| entry.metadata.etag.as_str());
        debug!(package = %name, conditional = known_etag.is_some(), "fetching metadata upstream");

        match self.registry.fetch_package(name, known_etag).await {
            Ok(PackageFetch::Modified(metadata)) => {
                let metadata = Arc::new(metadata);
                self.store(name, Arc::clone(&metadata));
                Ok(Some(metadata))
            }
            Ok(PackageFetch::NotModified) => match cached {
                Some(entry) => {
                    self.store(name, Arc::clone(&entry.metadata));
                    Ok(Some(entry.metadata))
                }
                None => Err(ProxyError::upstream(format!(
                    "upstream answered 304 for {name} without a validator"
                ))),
            },
            Ok(PackageFetch::NotFound) => {
                if self.entries.write().remove(name).is_some() {
                    debug!(package = %name, "package gone upstream, dropped cached entry");
                }
                Ok(None)
            }
            Err(err @ ProxyError::UpstreamUnavailable(_)) if self.stale_if_error => match cached {
                Some(entry) => {
                    warn!(package = %name, error = %err, "serving stale metadata");
                    Ok(Some(entry.metadata))
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    fn entry(&self, name: &str) -> Option<Entry> {
        self.entries.read().get(name).cloned()
    }

    fn store(&self, name: &str, metadata: Arc<PackageMetadata>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.write().insert(
            name.to_string(),
            Entry {
                metadata,
                revalidated_at: Instant::now(),
                generation,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn resolve(metadata: &Arc<PackageMetadata>, validator: Option<&str>) -> PackageLookup {
    if validator == Some(metadata.etag.as_str()) {
        PackageLookup::NotModified
    } else {
        PackageLookup::Fresh(Arc::clone(metadata))
    }
}
