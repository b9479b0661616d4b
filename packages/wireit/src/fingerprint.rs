//! Fingerprint computation.
//!
//! A fingerprint is the canonical serialization of everything that
//! contributes to a script's output: the platform, the command, the digest
//! of every input file, the clean policy, the output globs, the declared
//! environment values, and the fingerprints of every cascading dependency.
//! If the fingerprint hasn't changed, the script doesn't need to run.
//!
//! The serialization is fully deterministic: map-like sections sort keys
//! lexicographically, while glob patterns and env names keep the user's
//! declared order (their order is meaningful). The *fingerprint string* is
//! the serialization itself; the *fingerprint digest* is its SHA-256. Both
//! are content-addressed primitives: the digest keys the cache.
//!
//! Extra `--` args deliberately do not participate, so changing them never
//! invalidates the cache.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use color_eyre::{Result, eyre::Context};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{
    fs::{self, Fs},
    glob::{self, EntryKind, GlobOptions},
    script::{Clean, ScriptConfig},
};

/// The platform tag separating otherwise-identical fingerprints across
/// operating systems and architectures, so cached outputs never migrate
/// between incompatible hosts.
pub fn platform_tag() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Digest of one input file.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileDigest {
    pub sha256: String,
    /// For symlinks, the link's target path; the target path itself is part
    /// of the input, not just the content behind it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub link: Option<String>,
}

/// One declared environment variable and its value at fingerprint time.
/// `None` (absent) is distinct from an empty string.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    pub value: Option<String>,
}

/// The canonical fingerprint record. Field order is part of the format.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct FingerprintData {
    pub platform: String,
    pub command: Option<String>,
    pub clean: Clean,
    /// Input file digests keyed by package-relative path, sorted.
    /// `None` when `files` is not declared.
    pub files: Option<BTreeMap<String, FileDigest>>,
    /// Output glob patterns in declaration order. `None` when not declared.
    pub output: Option<Vec<String>>,
    /// Env entries in declaration order.
    pub env: Vec<EnvEntry>,
    pub cacheable: bool,
    /// Fingerprint strings of cascading dependencies, keyed by the
    /// dependency's canonical ref string, sorted.
    pub dependencies: BTreeMap<String, String>,
}

/// A computed fingerprint: the canonical data, its serialization, and the
/// serialization's SHA-256.
#[derive(Clone, PartialEq, Debug)]
pub struct Fingerprint {
    data: FingerprintData,
    string: Arc<str>,
    digest: String,
}

impl Fingerprint {
    /// Compute the fingerprint for `config`, given the already-computed
    /// fingerprints of its cascading dependencies.
    ///
    /// A script is cacheable iff its `files` are declared AND every
    /// cascading dependency is cacheable. Uncacheable scripts still get a
    /// fingerprint (freshness checks need one), but nothing is persisted to
    /// the cache for them.
    #[instrument(skip_all, fields(script = %config.script))]
    pub async fn compute(
        fs: &Fs,
        config: &ScriptConfig,
        dependencies: &[(String, Arc<Fingerprint>)],
    ) -> Result<Fingerprint> {
        let cacheable =
            config.files.is_some() && dependencies.iter().all(|(_, dep)| dep.cacheable());

        let files = match &config.files {
            None => None,
            Some(patterns) => Some(
                digest_files(
                    fs,
                    config.package(),
                    patterns,
                    GlobOptions {
                        allow_usually_excluded_paths: config.allow_usually_excluded_paths,
                        ..Default::default()
                    },
                )
                .await?,
            ),
        };

        let env = config
            .env
            .iter()
            .map(|name| EnvEntry {
                name: name.clone(),
                value: std::env::var(name).ok(),
            })
            .collect();

        let dependencies = dependencies
            .iter()
            .map(|(label, dep)| (label.clone(), dep.string.to_string()))
            .collect();

        let data = FingerprintData {
            platform: platform_tag(),
            command: config.command().map(str::to_owned),
            clean: config.clean,
            files,
            output: config.output.clone(),
            env,
            cacheable,
            dependencies,
        };
        Ok(Self::from_data(data))
    }

    fn from_data(data: FingerprintData) -> Self {
        let string: Arc<str> =
            serde_json::to_string(&data).expect("fingerprint serialization is infallible").into();
        let digest = fs::hash_buffer(string.as_bytes());
        trace!(%digest, "computed fingerprint");
        Self {
            data,
            string,
            digest,
        }
    }

    /// Parse a previously-persisted fingerprint string.
    pub fn parse(string: &str) -> Result<Fingerprint> {
        let data: FingerprintData =
            serde_json::from_str(string).context("parse persisted fingerprint")?;
        Ok(Self::from_data(data))
    }

    /// The canonical serialization.
    pub fn string(&self) -> &str {
        &self.string
    }

    /// SHA-256 of the canonical serialization, hex-encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn cacheable(&self) -> bool {
        self.data.cacheable
    }

    /// Package-relative paths of the input files recorded in this
    /// fingerprint.
    pub fn input_files(&self) -> impl Iterator<Item = &str> {
        self.data
            .files
            .iter()
            .flat_map(|files| files.keys())
            .map(String::as_str)
    }
}

/// Resolve the input globs and digest every matched file with bounded
/// concurrency.
async fn digest_files(
    fs: &Fs,
    package: &Path,
    patterns: &[String],
    options: GlobOptions,
) -> Result<BTreeMap<String, FileDigest>> {
    let entries = glob::resolve(package, patterns, options).await?;

    stream::iter(entries)
        .filter(|entry| {
            // Directories contribute through their contents, which the walk
            // already yielded.
            let keep = entry.kind != EntryKind::Dir;
            async move { keep }
        })
        .map(|entry| async move {
            let rel = entry
                .path
                .strip_prefix(package)
                .context("make path package-relative")?
                .to_string_lossy()
                .into_owned();
            let digest = match entry.kind {
                EntryKind::File => FileDigest {
                    sha256: fs.hash_file(&entry.path).await?,
                    link: None,
                },
                EntryKind::Symlink => {
                    let link = fs
                        .read_link(&entry.path)
                        .await?
                        .map(|target| target.to_string_lossy().into_owned());
                    // Follow the link for content; a broken link digests as
                    // empty content plus the target path.
                    let sha256 = match fs.metadata(&entry.path).await? {
                        Some(metadata) if metadata.is_file() => {
                            fs.hash_file(&entry.path).await?
                        }
                        _ => fs::hash_buffer(b""),
                    };
                    FileDigest { sha256, link }
                }
                EntryKind::Dir => unreachable!("directories filtered above"),
            };
            Ok::<_, color_eyre::Report>((rel, digest))
        })
        .buffer_unordered(fs::DEFAULT_CONCURRENCY)
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Execution, ScriptRef};
    use pretty_assertions::assert_eq;

    fn config(package: &Path, files: Option<Vec<String>>) -> ScriptConfig {
        ScriptConfig {
            script: ScriptRef::new(package, "build"),
            execution: Execution::OneShot {
                command: "echo build".into(),
            },
            dependencies: Vec::new(),
            files,
            output: Some(vec!["out/**".into()]),
            clean: Clean::Always,
            env: Vec::new(),
            allow_usually_excluded_paths: false,
            service_deps: Vec::new(),
            extra_args: None,
            directly_invoked: true,
            declaring_file: package.join("package.json"),
            config_location: None,
        }
    }

    #[tokio::test]
    async fn deterministic_across_recomputation() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("b.txt"), "b").unwrap();
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();

        let fs = Fs::default();
        let config = config(temp.path(), Some(vec!["*.txt".into()]));
        let first = Fingerprint::compute(&fs, &config, &[]).await.unwrap();
        let second = Fingerprint::compute(&fs, &config, &[]).await.unwrap();
        assert_eq!(first.string(), second.string());
        assert_eq!(first.digest(), second.digest());
    }

    #[tokio::test]
    async fn content_change_changes_digest() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("input");
        std::fs::write(&input, "v0").unwrap();

        let fs = Fs::default();
        let config = config(temp.path(), Some(vec!["input".into()]));
        let before = Fingerprint::compute(&fs, &config, &[]).await.unwrap();

        std::fs::write(&input, "v1").unwrap();
        let after = Fingerprint::compute(&fs, &config, &[]).await.unwrap();
        assert_ne!(before.digest(), after.digest());

        // Reverting the content reverts the fingerprint.
        std::fs::write(&input, "v0").unwrap();
        let reverted = Fingerprint::compute(&fs, &config, &[]).await.unwrap();
        assert_eq!(before.digest(), reverted.digest());
    }

    #[tokio::test]
    async fn undefined_files_is_uncacheable_and_distinct_from_empty() {
        let temp = tempfile::tempdir().unwrap();
        let fs = Fs::default();

        let undefined = Fingerprint::compute(&fs, &config(temp.path(), None), &[])
            .await
            .unwrap();
        let empty = Fingerprint::compute(&fs, &config(temp.path(), Some(Vec::new())), &[])
            .await
            .unwrap();

        assert!(!undefined.cacheable());
        assert!(empty.cacheable());
        assert_ne!(undefined.string(), empty.string());
    }

    #[tokio::test]
    async fn uncacheable_dependency_poisons_cacheability() {
        let temp = tempfile::tempdir().unwrap();
        let fs = Fs::default();

        let uncacheable_dep = Fingerprint::compute(&fs, &config(temp.path(), None), &[])
            .await
            .unwrap();
        let dependent = Fingerprint::compute(
            &fs,
            &config(temp.path(), Some(Vec::new())),
            &[("dep".into(), Arc::new(uncacheable_dep))],
        )
        .await
        .unwrap();
        assert!(!dependent.cacheable());
    }

    #[tokio::test]
    async fn round_trips_through_parse() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("input"), "v0").unwrap();

        let fs = Fs::default();
        let config = config(temp.path(), Some(vec!["input".into()]));
        let computed = Fingerprint::compute(&fs, &config, &[]).await.unwrap();
        let parsed = Fingerprint::parse(computed.string()).unwrap();
        assert_eq!(computed.digest(), parsed.digest());
        assert_eq!(parsed.input_files().collect::<Vec<_>>(), vec!["input"]);
    }
}
