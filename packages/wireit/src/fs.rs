//! Filesystem operations tailored to `wireit`.
//!
//! Inside this module we refer to `std::fs` or `tokio::fs` by fully
//! qualified path to make it maximally clear which is in use.
//!
//! Every operation that opens a file descriptor goes through a counting
//! semaphore so that a wide fingerprinting or cache-restore fan-out can't
//! exhaust the process's descriptor budget. The default budget is 200 and
//! can be overridden with `WIREIT_MAX_OPEN_FILES`.

use std::{fmt::Debug as StdDebug, io::Write as _, path::Path, sync::Arc};

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use fslock::LockFile as FsLockFile;
use sha2::{Digest, Sha256};
use tap::TapFallible;
use tokio::{
    io::AsyncReadExt,
    sync::{Mutex, OwnedSemaphorePermit, Semaphore},
    task::spawn_blocking,
};
use tracing::{instrument, trace};

/// The default file-descriptor budget.
pub const DEFAULT_MAX_OPEN_FILES: usize = 200;

/// The default level of concurrency for fan-out operations (hashing, cache
/// copies). Deliberately far below the descriptor budget so several scripts
/// can fingerprint at once without queueing on the semaphore.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Bounded-concurrency filesystem adapter.
///
/// Cheap to clone; clones share the descriptor budget.
#[derive(Clone, Debug)]
pub struct Fs {
    #[debug(skip)]
    files: Arc<Semaphore>,
}

impl Default for Fs {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPEN_FILES)
    }
}

impl Fs {
    pub fn new(max_open_files: usize) -> Self {
        Self {
            files: Arc::new(Semaphore::new(max_open_files.max(1))),
        }
    }

    /// Reserve one descriptor from the budget.
    async fn permit(&self) -> OwnedSemaphorePermit {
        self.files
            .clone()
            .acquire_owned()
            .await
            .expect("file semaphore closed")
    }

    /// Buffer the file content from disk. `None` if the file doesn't exist.
    #[instrument(skip(self))]
    pub async fn read(&self, path: impl AsRef<Path> + StdDebug) -> Result<Option<Vec<u8>>> {
        let path = path.as_ref();
        let _permit = self.permit().await;
        match tokio::fs::read(path).await {
            Ok(buf) => {
                trace!(?path, bytes = buf.len(), "read file");
                Ok(Some(buf))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("read file: {path:?}")),
        }
    }

    /// Buffer the file content from disk and parse it as UTF8.
    #[instrument(skip(self))]
    pub async fn read_to_string(&self, path: impl AsRef<Path> + StdDebug) -> Result<Option<String>> {
        let path = path.as_ref();
        let _permit = self.permit().await;
        match tokio::fs::read_to_string(path).await {
            Ok(buf) => {
                trace!(?path, bytes = buf.len(), "read file as string");
                Ok(Some(buf))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("read file: {path:?}")),
        }
    }

    /// Write the provided content to disk, creating parent directories.
    #[instrument(skip(self, content))]
    pub async fn write(
        &self,
        path: impl AsRef<Path> + StdDebug,
        content: impl AsRef<[u8]>,
    ) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }
        let _permit = self.permit().await;
        tokio::fs::write(path, content.as_ref())
            .await
            .with_context(|| format!("write file: {path:?}"))
            .tap_ok(|_| trace!(?path, "write file"))
    }

    /// Atomically write the provided content: write to a temporary file in
    /// the same directory, then rename into place. A crash mid-write leaves
    /// either the old content or nothing, never a torn file.
    #[instrument(skip(self, content))]
    pub async fn write_atomic(
        &self,
        path: impl AsRef<Path> + StdDebug,
        content: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let content = content.into();
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }
        let _permit = self.permit().await;
        spawn_blocking(move || -> Result<()> {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let mut temp = tempfile::NamedTempFile::new_in(parent)
                .with_context(|| format!("create temp file in {parent:?}"))?;
            temp.write_all(&content).context("write temp file")?;
            temp.persist(&path)
                .with_context(|| format!("rename temp file to {path:?}"))?;
            trace!(?path, "atomic write");
            Ok(())
        })
        .await
        .context("join task")?
    }

    /// Create the directory and all its parents, if they don't already exist.
    #[instrument(skip(self))]
    pub async fn create_dir_all(&self, dir: impl AsRef<Path> + StdDebug) -> Result<()> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create dir: {dir:?}"))
            .tap_ok(|_| trace!(?dir, "create directory"))
    }

    /// Remove a file or symlink. Symlinks are unlinked without following.
    /// Missing paths are not an error.
    #[instrument(skip(self))]
    pub async fn remove_file(&self, path: impl AsRef<Path> + StdDebug) -> Result<()> {
        let path = path.as_ref();
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                trace!(?path, "remove file");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("remove file: {path:?}")),
        }
    }

    /// Remove a directory if it is empty. Missing or non-empty directories
    /// are not an error; reports whether the directory was removed.
    #[instrument(skip(self))]
    pub async fn remove_dir_if_empty(&self, path: impl AsRef<Path> + StdDebug) -> Result<bool> {
        let path = path.as_ref();
        match tokio::fs::remove_dir(path).await {
            Ok(()) => {
                trace!(?path, "remove empty directory");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            // Non-empty is the common benign case; the raw os error for it
            // differs by platform, so treat any failure here as "kept".
            Err(_) => Ok(false),
        }
    }

    /// Remove the directory and all its contents. Missing is not an error.
    #[instrument(skip(self))]
    pub async fn remove_dir_all(&self, path: impl AsRef<Path> + StdDebug) -> Result<()> {
        let path = path.as_ref();
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                trace!(?path, "removed directory");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("remove directory: {path:?}")),
        }
    }

    /// Rename a file or directory, replacing the destination.
    #[instrument(skip(self))]
    pub async fn rename(
        &self,
        src: impl AsRef<Path> + StdDebug,
        dst: impl AsRef<Path> + StdDebug,
    ) -> Result<()> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        tokio::fs::rename(src, dst)
            .await
            .with_context(|| format!("rename: {src:?} -> {dst:?}"))
            .tap_ok(|_| trace!(?src, ?dst, "rename"))
    }

    /// Get the metadata for a path, following symlinks. `None` if missing.
    #[instrument(skip(self))]
    pub async fn metadata(
        &self,
        path: impl AsRef<Path> + StdDebug,
    ) -> Result<Option<std::fs::Metadata>> {
        let path = path.as_ref();
        let _permit = self.permit().await;
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("stat metadata: {path:?}")),
        }
    }

    /// Get the metadata for a path without following symlinks.
    #[instrument(skip(self))]
    pub async fn symlink_metadata(
        &self,
        path: impl AsRef<Path> + StdDebug,
    ) -> Result<Option<std::fs::Metadata>> {
        let path = path.as_ref();
        let _permit = self.permit().await;
        match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("lstat metadata: {path:?}")),
        }
    }

    /// Check whether the path exists (following symlinks).
    ///
    /// Note that this sort of check is prone to race conditions: if you plan
    /// to do anything with the file after checking, you should probably just
    /// try the operation and handle the missing case.
    #[instrument(skip(self))]
    pub async fn exists(&self, path: impl AsRef<Path> + StdDebug) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Read the target of a symlink.
    #[instrument(skip(self))]
    pub async fn read_link(
        &self,
        path: impl AsRef<Path> + StdDebug,
    ) -> Result<Option<std::path::PathBuf>> {
        let path = path.as_ref();
        let _permit = self.permit().await;
        match tokio::fs::read_link(path).await {
            Ok(target) => Ok(Some(target)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("read link: {path:?}")),
        }
    }

    /// Create a symlink at `link` pointing at `target`, replacing any
    /// existing file or link at that path.
    #[instrument(skip(self))]
    pub async fn symlink(
        &self,
        target: impl AsRef<Path> + StdDebug,
        link: impl AsRef<Path> + StdDebug,
    ) -> Result<()> {
        let (target, link) = (target.as_ref(), link.as_ref());
        self.remove_file(link).await?;
        if let Some(parent) = link.parent() {
            self.create_dir_all(parent).await?;
        }
        #[cfg(unix)]
        let result = tokio::fs::symlink(target, link).await;
        #[cfg(windows)]
        let result = tokio::fs::symlink_file(target, link).await;
        result
            .with_context(|| format!("symlink {link:?} -> {target:?}"))
            .tap_ok(|_| trace!(?link, ?target, "create symlink"))
    }

    /// Copy the file from `src` to `dst`, creating parent directories.
    /// Returns the total number of bytes copied.
    #[instrument(skip(self))]
    pub async fn copy_file(
        &self,
        src: impl AsRef<Path> + StdDebug,
        dst: impl AsRef<Path> + StdDebug,
    ) -> Result<u64> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        if let Some(parent) = dst.parent() {
            self.create_dir_all(parent).await?;
        }
        let _permit = self.permit().await;
        tokio::fs::copy(src, dst)
            .await
            .with_context(|| format!("copy {src:?} to {dst:?}"))
            .tap_ok(|bytes| trace!(?src, ?dst, ?bytes, "copy file"))
    }

    /// Set the file to be executable.
    ///
    /// On Windows this is a no-op: whether a file is executable there is an
    /// intrinsic property of the path extension, not a permission bit.
    #[instrument(skip(self))]
    pub async fn set_executable(&self, path: impl AsRef<Path> + StdDebug) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;

            let path = path.as_ref();
            let _permit = self.permit().await;
            let metadata = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("get metadata: {path:?}"))?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            tokio::fs::set_permissions(path, permissions)
                .await
                .with_context(|| format!("set permissions: {path:?}"))?;
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    /// Check whether the file has any executable bit set. Always `false` on
    /// Windows and for missing files.
    #[instrument(skip(self))]
    pub async fn is_executable(&self, path: impl AsRef<Path> + StdDebug) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            match self.metadata(path).await {
                Ok(Some(metadata)) => metadata.permissions().mode() & 0o111 != 0,
                _ => false,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            false
        }
    }

    /// Stream the file through SHA-256, returning the hex digest.
    #[instrument(skip(self))]
    pub async fn hash_file(&self, path: impl AsRef<Path> + StdDebug) -> Result<String> {
        let path = path.as_ref();
        let _permit = self.permit().await;
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open file: {path:?}"))?;
        let mut hasher = Sha256::new();
        let mut data = vec![0; 64 * 1024];
        let mut bytes = 0usize;
        loop {
            let len = file.read(&mut data).await.context("read chunk")?;
            if len == 0 {
                break;
            }
            hasher.update(&data[..len]);
            bytes += len;
        }
        let digest = hex::encode(hasher.finalize());
        trace!(?path, %digest, ?bytes, "hash file");
        Ok(digest)
    }
}

/// Hash a buffer with SHA-256, returning the hex digest.
pub fn hash_buffer(content: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(content.as_ref()))
}

/// Shared advisory lock file on the file system.
///
/// Lock with [`LockFile::lock`] or [`LockFile::try_lock`]; unlock by
/// dropping the returned [`LockedFile`]. The unlocked and locked states are
/// separate types so that an already-locked handle cannot be locked again
/// (fslock panics on that).
#[derive(Debug, Clone, Display)]
#[display("{}", path.display())]
pub struct LockFile {
    path: std::path::PathBuf,
    #[debug(skip)]
    inner: Arc<Mutex<FsLockFile>>,
}

/// A held advisory lock. Dropping releases it.
#[derive(Debug)]
pub struct LockedFile {
    path: std::path::PathBuf,
    // fslock releases the lock when the handle drops.
    #[debug(skip)]
    _inner: Arc<Mutex<FsLockFile>>,
}

impl LockFile {
    /// Create a new instance at the provided path, creating parents.
    pub async fn open(fs: &Fs, path: impl Into<std::path::PathBuf> + StdDebug) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent).await?;
        }
        let open_path = path.clone();
        let file = spawn_blocking(move || FsLockFile::open(open_path.as_path()))
            .await
            .context("join task")?
            .with_context(|| format!("open lock file: {path:?}"))?;
        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(file)),
        })
    }

    /// Attempt to take the lock without blocking. `None` if contended; the
    /// handle stays usable for retries.
    #[instrument(skip_all, fields(%self))]
    pub async fn try_lock(&self) -> Result<Option<LockedFile>> {
        let inner = self.inner.clone();
        let acquired = spawn_blocking(move || {
            let mut file = inner.blocking_lock();
            file.try_lock()
        })
        .await
        .context("join task")?
        .with_context(|| format!("try lock file: {:?}", self.path))?;

        if acquired {
            trace!(path = ?self.path, "locked file");
            Ok(Some(LockedFile {
                path: self.path.clone(),
                _inner: self.inner.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Take the lock, blocking until the current holder releases it.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(&self) -> Result<LockedFile> {
        let inner = self.inner.clone();
        spawn_blocking(move || {
            let mut file = inner.blocking_lock();
            file.lock()
        })
        .await
        .context("join task")?
        .with_context(|| format!("lock file: {:?}", self.path))?;

        trace!(path = ?self.path, "locked file");
        Ok(LockedFile {
            path: self.path.clone(),
            _inner: self.inner.clone(),
        })
    }
}

impl LockedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let fs = Fs::default();
        let path = temp.path().join("state");

        fs.write_atomic(&path, b"one".to_vec()).await.unwrap();
        fs.write_atomic(&path, b"two".to_vec()).await.unwrap();

        let content = fs.read(&path).await.unwrap().unwrap();
        assert_eq!(content, b"two");
    }

    #[tokio::test]
    async fn hash_file_matches_buffer_hash() {
        let temp = tempfile::tempdir().unwrap();
        let fs = Fs::default();
        let path = temp.path().join("input");
        fs.write(&path, b"v0").await.unwrap();

        let hashed = fs.hash_file(&path).await.unwrap();
        assert_eq!(hashed, hash_buffer(b"v0"));
    }

    #[tokio::test]
    async fn try_lock_reports_contention() {
        let temp = tempfile::tempdir().unwrap();
        let fs = Fs::default();
        let path = temp.path().join("locks").join("a");

        let held = LockFile::open(&fs, &path)
            .await
            .unwrap()
            .try_lock()
            .await
            .unwrap()
            .expect("first lock succeeds");

        let contended = LockFile::open(&fs, &path)
            .await
            .unwrap()
            .try_lock()
            .await
            .unwrap();
        assert!(contended.is_none());

        drop(held);
        let reacquired = LockFile::open(&fs, &path)
            .await
            .unwrap()
            .try_lock()
            .await
            .unwrap();
        assert!(reacquired.is_some());
    }
}
