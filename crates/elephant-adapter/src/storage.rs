use std::{
    future::Future,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
use path_clean::PathClean;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_MS: u64 = 100;

/// Directory-rooted blob store. Paths handed to it are relative to the root.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: PathBuf) -> Self {
        FilesystemStorage { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating storage root {}", self.root.display()))
    }

    /// Maps a relative key under the root. Keys that would land outside it
    /// (absolute paths, `..` escapes) are rejected.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let cleaned = Path::new(relative).clean();
        let escapes = cleaned
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || cleaned.as_os_str().is_empty() || cleaned == Path::new(".") {
            bail!("storage key {relative:?} escapes {}", self.root.display());
        }
        Ok(self.root.join(cleaned))
    }

    /// Opens a stored blob. `Ok(None)` means nothing is stored under `relative`.
    pub async fn open_read(&self, relative: &str) -> Result<Option<FileHandle>> {
        FileHandle::open(self.resolve(relative)?).await
    }

    /// Starts an atomic write: bytes land in a sibling temp file and only
    /// appear under `relative` once [`TempFile::commit`] renames it.
    pub async fn create_temp_writer(&self, relative: &str) -> Result<TempFile> {
        let final_path = self.resolve(relative)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating storage dir {}", parent.display()))?;
        }

        let tmp_path = temp_path_for(&final_path);
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        let file = with_io_retry("create_temp_writer", &tmp_path, || options.open(&tmp_path))
            .await?;

        Ok(TempFile {
            tmp_path,
            final_path,
            file,
        })
    }
}

/// An open blob together with the byte length it had when opened.
#[derive(Debug)]
pub struct FileHandle {
    pub file: File,
    pub size: u64,
    pub path: PathBuf,
}

impl FileHandle {
    pub async fn open(path: PathBuf) -> Result<Option<Self>> {
        let file = match with_io_retry("open_read", &path, || File::open(&path)).await {
            Ok(file) => file,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err),
        };

        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("reading metadata {}", path.display()))?;

        Ok(Some(FileHandle {
            file,
            size: metadata.len(),
            path,
        }))
    }

    /// Opens a second, independent handle on the same blob.
    pub async fn reopen(&self) -> Result<Option<Self>> {
        Self::open(self.path.clone()).await
    }
}

pub struct TempFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
}

impl TempFile {
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Moves the temp file into place. On failure the temp file is removed
    /// and nothing appears under the final path.
    pub async fn commit(self) -> Result<()> {
        let Self {
            tmp_path,
            final_path,
            file,
        } = self;

        let result = persist(file, &tmp_path, &final_path).await;
        if result.is_err() {
            remove_temp(&tmp_path).await;
        }
        result
    }

    pub async fn rollback(self) -> Result<()> {
        let Self { tmp_path, file, .. } = self;
        drop(file);
        match fs::remove_file(&tmp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("removing temp file {}", tmp_path.display()))),
        }
    }
}

async fn persist(mut file: File, tmp_path: &Path, final_path: &Path) -> Result<()> {
    file.flush()
        .await
        .with_context(|| format!("flushing {}", tmp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", tmp_path.display()))?;
    drop(file);

    with_io_retry("commit", final_path, || fs::rename(tmp_path, final_path))
        .await
        .with_context(|| {
            format!(
                "moving {} to {}",
                tmp_path.display(),
                final_path.display()
            )
        })
}

async fn remove_temp(tmp_path: &Path) {
    match fs::remove_file(tmp_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            path = %tmp_path.display(),
            error = %e,
            "failed to remove temp file after failed commit"
        ),
    }
}

async fn with_io_retry<T, F, Fut>(operation: &str, path: &Path, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) && attempt < MAX_ATTEMPTS => {
                tracing::debug!(
                    operation,
                    attempt,
                    max_attempts = MAX_ATTEMPTS,
                    kind = ?e.kind(),
                    path = %path.display(),
                    "storage operation failed, retrying in {BACKOFF_MS}ms"
                );
                tokio::time::sleep(Duration::from_millis(BACKOFF_MS)).await;
            }
            Err(e) => {
                return Err(anyhow::Error::from(e).context(format!(
                    "{operation} {} (after {attempt} attempts)",
                    path.display()
                )));
            }
        }
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == ErrorKind::NotFound)
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    let tmp_name = match final_path.file_name().and_then(|s| s.to_str()) {
        Some(name) => format!(".{name}.partial-{pid}-{timestamp}"),
        None => format!(".partial-{pid}-{timestamp}"),
    };
    final_path.with_file_name(tmp_name)
}

// EBUSY (16) and EAGAIN (11) show up on network filesystems under load.
fn should_retry(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
        || matches!(error.raw_os_error(), Some(16) | Some(11))
}
