//! Content-addressed output caching.
//!
//! Two interchangeable backends store a script's output keyed by its
//! fingerprint digest: a local filesystem cache under the package's
//! `.wireit/cache/` directory, and a remote GitHub-Actions-style blob
//! service. Both key by the *cache-entry key*: a hash over the package
//! directory, the script name, the fingerprint digest, and the platform tag,
//! so outputs can never contaminate a different script or operating system.
//!
//! Cache I/O failures never fail the owning script: a miss is a miss, and a
//! failed write is logged and ignored by the caller.

pub mod github;
pub mod local;

use std::{
    future::Future,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    fingerprint::platform_tag,
    fs::{self, Fs},
    glob::{EntryKind, GlobEntry},
    script::ScriptRef,
    state::Replay,
};

pub use github::GithubCache;
pub use local::LocalCache;

/// Compute the cache-entry key for a script at a fingerprint.
pub fn entry_key(script: &ScriptRef, digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.package.to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(script.name.as_bytes());
    hasher.update([0]);
    hasher.update(digest.as_bytes());
    hasher.update([0]);
    hasher.update(platform_tag().as_bytes());
    hex::encode(hasher.finalize())
}

/// One output entry recorded in a cache manifest. Paths are
/// package-relative with `/` separators.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
    /// Symlink target, for `kind == symlink`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub link: Option<String>,
    #[serde(default)]
    pub executable: bool,
}

/// Index of everything inside one cache entry.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CacheManifest {
    pub entries: Vec<ManifestEntry>,
}

/// Result of a store attempt. A backend may decline to store (empty entry
/// set, size budget); the engine treats that as benign.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StoreOutcome {
    Stored,
    Skipped,
}

/// Output restored from a cache entry.
#[derive(Clone, Debug)]
pub struct RestoredOutput {
    /// Absolute paths that were written into the package directory.
    pub paths: Vec<PathBuf>,
    pub replay: Replay,
}

/// Uniform interface over the cache backends.
pub trait CacheBackend: Send + Sync {
    /// Look up an entry. A hit returns an applier; invoking it writes the
    /// cached output into the package directory.
    fn get(
        &self,
        script: &ScriptRef,
        digest: &str,
    ) -> impl Future<Output = Result<Option<CacheHit>>> + Send;

    /// Store the given output entries for this fingerprint digest.
    fn set(
        &self,
        script: &ScriptRef,
        digest: &str,
        entries: &[GlobEntry],
        replay: &Replay,
    ) -> impl Future<Output = Result<StoreOutcome>> + Send;
}

/// The configured cache, dispatching to one of the backends.
#[derive(Clone, Debug)]
pub enum Cache {
    Local(LocalCache),
    Github(GithubCache),
}

impl CacheBackend for Cache {
    async fn get(&self, script: &ScriptRef, digest: &str) -> Result<Option<CacheHit>> {
        match self {
            Cache::Local(cache) => cache.get(script, digest).await,
            Cache::Github(cache) => cache.get(script, digest).await,
        }
    }

    async fn set(
        &self,
        script: &ScriptRef,
        digest: &str,
        entries: &[GlobEntry],
        replay: &Replay,
    ) -> Result<StoreOutcome> {
        match self {
            Cache::Local(cache) => cache.set(script, digest, entries, replay).await,
            Cache::Github(cache) => cache.set(script, digest, entries, replay).await,
        }
    }
}

/// A cache hit, not yet applied.
#[derive(Debug)]
pub enum CacheHit {
    Local(local::LocalHit),
    Github(github::GithubHit),
}

impl CacheHit {
    /// Write the cached output into the package directory, preserving file
    /// types, and return the restored paths plus replay buffers.
    pub async fn apply(self, fs: &Fs) -> Result<RestoredOutput> {
        match self {
            CacheHit::Local(hit) => hit.apply(fs).await,
            CacheHit::Github(hit) => hit.apply(fs).await,
        }
    }
}

/// Record the manifest entries for a set of matched output entries.
pub(crate) async fn snapshot_entries(
    fs: &Fs,
    package: &Path,
    entries: &[GlobEntry],
) -> Result<CacheManifest> {
    let records = stream::iter(entries.iter().cloned())
        .map(|entry| {
            let fs = fs.clone();
            let package = package.to_path_buf();
            async move {
                let rel = entry
                    .path
                    .strip_prefix(&package)
                    .context("make output path package-relative")?
                    .to_string_lossy()
                    .replace('\\', "/");
                let record = match entry.kind {
                    EntryKind::Dir => ManifestEntry {
                        path: rel,
                        kind: EntryKind::Dir,
                        size: None,
                        link: None,
                        executable: false,
                    },
                    EntryKind::Symlink => {
                        let link = fs
                            .read_link(&entry.path)
                            .await?
                            .map(|target| target.to_string_lossy().into_owned());
                        ManifestEntry {
                            path: rel,
                            kind: EntryKind::Symlink,
                            size: None,
                            link,
                            executable: false,
                        }
                    }
                    EntryKind::File => {
                        let size = fs
                            .symlink_metadata(&entry.path)
                            .await?
                            .map(|metadata| metadata.len());
                        let executable = fs.is_executable(&entry.path).await;
                        ManifestEntry {
                            path: rel,
                            kind: EntryKind::File,
                            size,
                            link: None,
                            executable,
                        }
                    }
                };
                Ok::<_, color_eyre::Report>(record)
            }
        })
        .buffered(fs::DEFAULT_CONCURRENCY)
        .try_collect()
        .await?;
    Ok(CacheManifest { entries: records })
}

/// Restore manifest entries into the package directory from a directory of
/// file contents laid out by entry path.
pub(crate) async fn restore_entries(
    fs: &Fs,
    package: &Path,
    manifest: &CacheManifest,
    files_root: &Path,
) -> Result<Vec<PathBuf>> {
    let mut restored = Vec::with_capacity(manifest.entries.len());
    // Sequential and parents-first: directories were recorded before their
    // contents by the glob walk.
    for entry in &manifest.entries {
        let dst = package.join(&entry.path);
        match entry.kind {
            EntryKind::Dir => {
                fs.create_dir_all(&dst).await?;
            }
            EntryKind::File => {
                let src = files_root.join(&entry.path);
                fs.copy_file(&src, &dst).await?;
                if entry.executable {
                    fs.set_executable(&dst).await?;
                }
            }
            EntryKind::Symlink => {
                let Some(target) = &entry.link else {
                    continue;
                };
                fs.symlink(target, &dst).await?;
            }
        }
        restored.push(dst);
    }
    Ok(restored)
}
