//! A minimal filesystem abstraction for the packaging pipeline's scratch
//! space: one temp directory per request, files named into it, streamed to
//! and from. Kept behind a trait so tests can swap in an in-memory double
//! instead of touching disk.

use std::path::{
    Path,
    PathBuf,
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use tokio::fs::File;
use tokio::io::{
    AsyncRead,
    AsyncWrite,
};

#[async_trait]
pub trait FileSpace: Send + Sync + 'static {
    /// Create a fresh, empty directory. Callers own its lifecycle and must
    /// call [`FileSpace::delete_dir`] when done with it.
    async fn create_temp_dir(&self) -> anyhow::Result<PathBuf>;

    /// Compute the path a file named `name` inside `dir` would have. Pure
    /// path arithmetic, no I/O: the file need not exist yet.
    fn new_file(&self, dir: &Path, name: &str) -> PathBuf {
        dir.join(name)
    }

    /// Open `path` for writing, creating it (and truncating if present) on
    /// first write.
    async fn writer(&self, path: &Path) -> anyhow::Result<Box<dyn AsyncWrite + Unpin + Send>>;

    /// Open `path` for reading. Fails if the file does not exist.
    async fn reader(&self, path: &Path) -> anyhow::Result<Box<dyn AsyncRead + Unpin + Send>>;

    async fn exists(&self, path: &Path) -> bool;

    async fn delete_file(&self, path: &Path) -> anyhow::Result<()>;

    async fn delete_dir(&self, dir: &Path) -> anyhow::Result<()>;

    /// Used by tests to assert a scratch directory was fully cleaned up.
    async fn is_empty(&self, dir: &Path) -> anyhow::Result<bool>;
}

/// Real filesystem implementation. Temp directories are created under
/// `root` (defaulting to the OS temp dir) with [`tempfile::Builder`] and
/// handed back as plain paths via `into_path`, so cleanup stays under the
/// caller's explicit control rather than firing on drop.
#[derive(Clone, Debug)]
pub struct LocalFileSpace {
    root: Option<PathBuf>,
}

impl LocalFileSpace {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl Default for LocalFileSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSpace for LocalFileSpace {
    async fn create_temp_dir(&self) -> anyhow::Result<PathBuf> {
        let root = self.root.clone();
        let dir = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            let mut builder = tempfile::Builder::new();
            builder.prefix("packager-");
            let temp_dir = match &root {
                Some(root) => builder.tempdir_in(root)?,
                None => builder.tempdir()?,
            };
            Ok(temp_dir.into_path())
        })
        .await??;
        tracing::debug!(?dir, "created scratch directory");
        Ok(dir)
    }

    async fn writer(&self, path: &Path) -> anyhow::Result<Box<dyn AsyncWrite + Unpin + Send>> {
        let file = File::create(path).await.map_err(|e| {
            anyhow::Error::new(e).context(ErrorMetadata::fatal(
                "FileSpaceError",
                format!("failed to open {} for writing", path.display()),
            ))
        })?;
        Ok(Box::new(file))
    }

    async fn reader(&self, path: &Path) -> anyhow::Result<Box<dyn AsyncRead + Unpin + Send>> {
        let file = File::open(path).await.map_err(|e| {
            anyhow::Error::new(e).context(ErrorMetadata::fatal(
                "FileSpaceError",
                format!("failed to open {} for reading", path.display()),
            ))
        })?;
        Ok(Box::new(file))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn delete_file(&self, path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).map_err(|e| {
                anyhow::Error::new(e).context(ErrorMetadata::fatal(
                    "FileSpaceError",
                    format!("failed to delete {}", path.display()),
                ))
            }),
        }
    }

    async fn delete_dir(&self, dir: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).map_err(|e| {
                anyhow::Error::new(e).context(ErrorMetadata::fatal(
                    "FileSpaceError",
                    format!("failed to delete directory {}", dir.display()),
                ))
            }),
        }
    }

    async fn is_empty(&self, dir: &Path) -> anyhow::Result<bool> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        Ok(entries.next_entry().await?.is_none())
    }
}
