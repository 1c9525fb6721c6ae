use std::sync::Arc;

use anyhow::{Context, anyhow};
use elephant_adapter::{FileHandle, FilesystemStorage};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::coalesce::InFlight;
use crate::{
    error::{ProxyError, ProxyResult},
    registry::tarball_storage_path,
    upstream::Registry,
};

/// A stored tarball: an open handle plus the length known before reading.
pub type Tarball = FileHandle;

#[derive(Debug)]
pub enum TarballLookup {
    Found(Tarball),
    NotFound,
}

/// Read-through tarball store. Tarballs are immutable upstream, so anything
/// already on disk is served as-is.
pub struct TarballCache<R> {
    registry: Arc<R>,
    storage: Arc<FilesystemStorage>,
    inflight: InFlight<Result<bool, Arc<ProxyError>>>,
}

impl<R: Registry> TarballCache<R> {
    pub fn new(registry: Arc<R>, storage: Arc<FilesystemStorage>) -> Self {
        Self {
            registry,
            storage,
            inflight: InFlight::new(),
        }
    }

    pub async fn get(&self, name: &str, filename: &str) -> ProxyResult<TarballLookup> {
        let relative = tarball_storage_path(name, filename);
        if let Some(tarball) = self.storage.open_read(&relative).await? {
            debug!(package = %name, %filename, size = tarball.size, "tarball cache hit");
            return Ok(TarballLookup::Found(tarball));
        }

        let key = relative.as_str();
        let stored = self
            .inflight
            .run(key, || async move {
                self.fetch_and_store(name, filename, key)
                    .await
                    .map_err(Arc::new)
            })
            .await?;
        if !stored {
            return Ok(TarballLookup::NotFound);
        }

        // Every caller gets its own handle on the shared file.
        let tarball = self
            .storage
            .open_read(&relative)
            .await?
            .ok_or_else(|| anyhow!("tarball {relative} vanished after commit"))?;
        Ok(TarballLookup::Found(tarball))
    }

    /// Downloads into storage. `Ok(false)` when upstream has no such tarball.
    async fn fetch_and_store(&self, name: &str, filename: &str, relative: &str) -> ProxyResult<bool> {
        if self.storage.open_read(relative).await?.is_some() {
            debug!(package = %name, %filename, "tarball stored by concurrent request");
            return Ok(true);
        }

        let Some(bytes) = self.registry.fetch_tarball(name, filename).await? else {
            debug!(package = %name, %filename, "tarball not found upstream");
            return Ok(false);
        };

        let mut temp = self.storage.create_temp_writer(relative).await?;
        if let Err(err) = temp.file_mut().write_all(&bytes).await {
            if let Err(cleanup) = temp.rollback().await {
                warn!(error = %cleanup, "failed to remove partial tarball");
            }
            return Err(anyhow::Error::from(err)
                .context(format!("writing tarball {relative}"))
                .into());
        }
        temp.commit()
            .await
            .with_context(|| format!("storing tarball {relative}"))?;

        info!(package = %name, %filename, size = bytes.len(), "cached tarball");
        Ok(true)
    }
}
