//! Local filesystem cache backend.
//!
//! Entries live under the declaring package at
//! `.wireit/cache/<script>/<digest>/`:
//!
//! - `files/<path>` -- copies of the output files.
//! - `manifest.json` -- the entry index with types and sizes.
//! - `stdout` / `stderr` -- captured replay buffers.
//!
//! Writes land in a temporary sibling directory first and are renamed into
//! place, so a crash mid-store never produces a half-entry that a later
//! lookup would trust.

use std::path::PathBuf;

use color_eyre::{
    Result,
    eyre::{Context, ContextCompat},
};
use tracing::{instrument, trace, warn};

use crate::{
    cache::{CacheBackend, CacheHit, CacheManifest, RestoredOutput, StoreOutcome},
    fs::Fs,
    glob::{EntryKind, GlobEntry},
    script::ScriptRef,
    state::{Replay, StateStore},
};

#[derive(Clone, Debug)]
pub struct LocalCache {
    fs: Fs,
}

impl LocalCache {
    pub fn new(fs: Fs) -> Self {
        Self { fs }
    }

    fn entry_dir(script: &ScriptRef, digest: &str) -> PathBuf {
        StateStore::cache_dir(script).join(digest)
    }
}

impl CacheBackend for LocalCache {
    #[instrument(name = "LocalCache::get", skip(self))]
    async fn get(&self, script: &ScriptRef, digest: &str) -> Result<Option<CacheHit>> {
        let dir = Self::entry_dir(script, digest);
        if !self.fs.exists(dir.join("manifest.json")).await {
            return Ok(None);
        }
        trace!(?dir, "local cache hit");
        Ok(Some(CacheHit::Local(LocalHit {
            package: script.package.clone(),
            dir,
        })))
    }

    #[instrument(name = "LocalCache::set", skip(self, entries, replay))]
    async fn set(
        &self,
        script: &ScriptRef,
        digest: &str,
        entries: &[GlobEntry],
        replay: &Replay,
    ) -> Result<StoreOutcome> {
        if entries.is_empty() {
            return Ok(StoreOutcome::Skipped);
        }
        let dir = Self::entry_dir(script, digest);
        if self.fs.exists(&dir).await {
            // Content-addressed: an existing entry is already correct.
            return Ok(StoreOutcome::Skipped);
        }

        let manifest = super::snapshot_entries(&self.fs, &script.package, entries).await?;

        // Stage into a temporary sibling, then rename into place.
        let staging = dir.with_file_name(format!("{digest}.tmp"));
        self.fs.remove_dir_all(&staging).await?;
        self.fs.create_dir_all(&staging).await?;

        for entry in &manifest.entries {
            if entry.kind != EntryKind::File {
                continue;
            }
            let src = script.package.join(&entry.path);
            let dst = staging.join("files").join(&entry.path);
            self.fs.copy_file(&src, &dst).await?;
        }
        self.fs
            .write(
                staging.join("manifest.json"),
                serde_json::to_vec(&manifest).context("serialize cache manifest")?,
            )
            .await?;
        self.fs
            .write(staging.join("stdout"), replay.stdout.clone())
            .await?;
        self.fs
            .write(staging.join("stderr"), replay.stderr.clone())
            .await?;

        match self.fs.rename(&staging, &dir).await {
            Ok(()) => Ok(StoreOutcome::Stored),
            Err(err) => {
                // Lost a race with a concurrent store of the same digest.
                warn!(?dir, ?err, "discarding staged cache entry");
                self.fs.remove_dir_all(&staging).await?;
                Ok(StoreOutcome::Skipped)
            }
        }
    }
}

/// An unapplied local cache hit.
#[derive(Debug)]
pub struct LocalHit {
    package: PathBuf,
    dir: PathBuf,
}

impl LocalHit {
    #[instrument(name = "LocalHit::apply", skip(fs))]
    pub async fn apply(self, fs: &Fs) -> Result<RestoredOutput> {
        let manifest = fs
            .read(self.dir.join("manifest.json"))
            .await?
            .context("cache entry lost its manifest")?;
        let manifest: CacheManifest =
            serde_json::from_slice(&manifest).context("parse cache manifest")?;

        let paths =
            super::restore_entries(fs, &self.package, &manifest, &self.dir.join("files")).await?;

        let stdout = fs.read(self.dir.join("stdout")).await?.unwrap_or_default();
        let stderr = fs.read(self.dir.join("stderr")).await?.unwrap_or_default();
        Ok(RestoredOutput {
            paths,
            replay: Replay { stdout, stderr },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(path: PathBuf, kind: EntryKind) -> GlobEntry {
        GlobEntry { path, kind }
    }

    #[tokio::test]
    async fn round_trips_files_and_replay() {
        let temp = tempfile::tempdir().unwrap();
        let package = temp.path().to_path_buf();
        std::fs::create_dir_all(package.join("out")).unwrap();
        std::fs::write(package.join("out/a.txt"), "v0").unwrap();

        let fs = Fs::default();
        let cache = LocalCache::new(fs.clone());
        let script = ScriptRef::new(&package, "build");
        let replay = Replay {
            stdout: b"built ok\n".to_vec(),
            stderr: Vec::new(),
        };

        let entries = vec![
            entry(package.join("out"), EntryKind::Dir),
            entry(package.join("out/a.txt"), EntryKind::File),
        ];
        let outcome = cache.set(&script, "digest0", &entries, &replay).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);

        // Clobber the output, then restore it from cache.
        std::fs::write(package.join("out/a.txt"), "clobbered").unwrap();
        let hit = cache
            .get(&script, "digest0")
            .await
            .unwrap()
            .expect("expected cache hit");
        let restored = hit.apply(&fs).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(package.join("out/a.txt")).unwrap(),
            "v0"
        );
        assert_eq!(restored.replay.stdout, b"built ok\n");
        assert!(restored.paths.contains(&package.join("out/a.txt")));
    }

    #[tokio::test]
    async fn miss_and_empty_set_behave() {
        let temp = tempfile::tempdir().unwrap();
        let fs = Fs::default();
        let cache = LocalCache::new(fs.clone());
        let script = ScriptRef::new(temp.path(), "build");

        assert!(cache.get(&script, "missing").await.unwrap().is_none());
        let outcome = cache
            .set(&script, "digest0", &[], &Replay::default())
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Skipped);
    }

    #[tokio::test]
    async fn existing_entry_is_not_rewritten() {
        let temp = tempfile::tempdir().unwrap();
        let package = temp.path().to_path_buf();
        std::fs::write(package.join("a"), "x").unwrap();

        let fs = Fs::default();
        let cache = LocalCache::new(fs.clone());
        let script = ScriptRef::new(&package, "build");
        let entries = vec![entry(package.join("a"), EntryKind::File)];

        let first = cache
            .set(&script, "digest0", &entries, &Replay::default())
            .await
            .unwrap();
        let second = cache
            .set(&script, "digest0", &entries, &Replay::default())
            .await
            .unwrap();
        assert_eq!(first, StoreOutcome::Stored);
        assert_eq!(second, StoreOutcome::Skipped);
    }
}
