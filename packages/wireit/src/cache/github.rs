//! Remote cache backend speaking the GitHub Actions cache protocol.
//!
//! Uploads negotiate a reserve-then-upload-then-commit sequence; large
//! archives are chunked into `Content-Range` PATCH requests. Downloads use
//! the pre-signed URL returned from lookup. Entries are tarballs, zstd by
//! preference with gzip accepted on download for compatibility with entries
//! written by other tooling.
//!
//! The service is authenticated with runtime tokens from the environment, or
//! fetched from a localhost credential custodian that tunnels them into
//! nested invocations. Tokens and pre-signed URLs are never logged.

use std::path::{Path, PathBuf};

use async_compression::tokio::{
    bufread::{GzipDecoder, ZstdDecoder},
    write::ZstdEncoder,
};
use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{debug, instrument, trace, warn};
use url::Url;

use clients::{Token, github::v1::Client};

use crate::{
    cache::{CacheBackend, CacheHit, CacheManifest, RestoredOutput, StoreOutcome, entry_key},
    fingerprint::platform_tag,
    fs::Fs,
    glob::{EntryKind, GlobEntry},
    script::ScriptRef,
    state::Replay,
};

/// Upload chunk size for ranged PATCH requests.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// The service's per-repo entry limit; larger archives are declined rather
/// than uploaded and rejected.
const MAX_ARCHIVE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Credentials JSON vended by the localhost custodian sidecar.
#[derive(Debug, Deserialize)]
struct CustodianPayload {
    #[allow(dead_code)]
    version: u32,
    caching: CustodianCaching,
}

#[derive(Debug, Deserialize)]
struct CustodianCaching {
    github: CustodianGithub,
}

#[derive(Debug, Deserialize)]
struct CustodianGithub {
    #[serde(rename = "ACTIONS_RESULTS_URL")]
    results_url: Option<String>,
    #[serde(rename = "ACTIONS_CACHE_URL")]
    cache_url: Option<String>,
    #[serde(rename = "ACTIONS_RUNTIME_TOKEN")]
    runtime_token: String,
}

#[derive(Clone, Debug)]
pub struct GithubCache {
    fs: Fs,
    client: Client,
    chunk_size: usize,
}

impl GithubCache {
    /// Build the backend from ambient credentials: `ACTIONS_CACHE_URL` (or
    /// `ACTIONS_RESULTS_URL`) plus `ACTIONS_RUNTIME_TOKEN`, falling back to
    /// the custodian sidecar when a port is configured. Returns `None` when
    /// no credentials are available.
    #[instrument(skip(fs))]
    pub async fn from_environment(fs: Fs, custodian_port: Option<u16>) -> Result<Option<Self>> {
        let base = std::env::var("ACTIONS_CACHE_URL")
            .or_else(|_| std::env::var("ACTIONS_RESULTS_URL"))
            .ok();
        let token = std::env::var("ACTIONS_RUNTIME_TOKEN").ok();

        let (base, token) = match (base, token) {
            (Some(base), Some(token)) => (base, Token::from(token)),
            _ => match custodian_port {
                None => return Ok(None),
                Some(port) => {
                    let creds = fetch_custodian_credentials(port).await?;
                    let base = creds
                        .cache_url
                        .or(creds.results_url)
                        .ok_or_eyre("credential custodian returned no cache URL")?;
                    (base, Token::from(creds.runtime_token))
                }
            },
        };

        let base = Url::parse(&base).context("parse cache service URL")?;
        let client = Client::new(base, token)?;
        Ok(Some(Self {
            fs,
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }))
    }

    pub fn new(fs: Fs, client: Client) -> Self {
        Self {
            fs,
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

async fn fetch_custodian_credentials(port: u16) -> Result<CustodianGithub> {
    let url = format!("http://127.0.0.1:{port}/");
    let body = reqwest::get(&url)
        .await
        .context("request credentials from custodian")?
        .error_for_status()
        .context("custodian response status")?
        .text()
        .await
        .context("read custodian response")?;
    let payload: CustodianPayload =
        serde_json::from_str(&body).context("parse custodian credentials")?;
    Ok(payload.caching.github)
}

impl CacheBackend for GithubCache {
    #[instrument(name = "GithubCache::get", skip(self))]
    async fn get(&self, script: &ScriptRef, digest: &str) -> Result<Option<CacheHit>> {
        let key = entry_key(script, digest);
        let Some(archive) = self.client.lookup(&key, &platform_tag()).await? else {
            return Ok(None);
        };
        debug!(%key, "remote cache hit");
        Ok(Some(CacheHit::Github(GithubHit {
            client: self.client.clone(),
            package: script.package.clone(),
            archive,
        })))
    }

    #[instrument(name = "GithubCache::set", skip(self, entries, replay))]
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
        let manifest = super::snapshot_entries(&self.fs, &script.package, entries).await?;

        let staging = tempfile::tempdir().context("create staging directory")?;
        let archive_path = staging.path().join("entry.tar.zst");
        build_archive(&script.package, &manifest, replay, &archive_path).await?;

        let size = self
            .fs
            .metadata(&archive_path)
            .await?
            .ok_or_eyre("staged archive disappeared")?
            .len();
        if size > MAX_ARCHIVE_SIZE {
            warn!(size, "archive exceeds the service size limit; declining to upload");
            return Ok(StoreOutcome::Skipped);
        }

        let key = entry_key(script, digest);
        let Some(id) = self
            .client
            .reserve(&key, &platform_tag(), Some(size))
            .await?
        else {
            // Another writer already owns this entry.
            return Ok(StoreOutcome::Skipped);
        };

        let mut file = tokio::fs::File::open(&archive_path)
            .await
            .context("open staged archive")?;
        let mut offset = 0u64;
        loop {
            let mut chunk = vec![0u8; self.chunk_size];
            let mut filled = 0usize;
            while filled < chunk.len() {
                let read = file
                    .read(&mut chunk[filled..])
                    .await
                    .context("read staged archive")?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
            if filled == 0 {
                break;
            }
            chunk.truncate(filled);
            self.client.upload_chunk(id, offset, chunk).await?;
            offset += filled as u64;
        }
        self.client.commit(id, size).await?;
        trace!(%key, size, "uploaded cache entry");
        Ok(StoreOutcome::Stored)
    }
}

/// An unapplied remote cache hit.
#[derive(Debug)]
pub struct GithubHit {
    client: Client,
    package: PathBuf,
    archive: Url,
}

impl GithubHit {
    #[instrument(name = "GithubHit::apply", skip_all)]
    pub async fn apply(self, fs: &Fs) -> Result<RestoredOutput> {
        let staging = tempfile::tempdir().context("create staging directory")?;
        let archive_path = staging.path().join("entry.tar");

        let mut file = tokio::fs::File::create(&archive_path)
            .await
            .context("create archive file")?;
        self.client.download_to(self.archive, &mut file).await?;
        drop(file);

        let extracted = staging.path().join("extracted");
        unpack_archive(&archive_path, &extracted).await?;

        let manifest = fs
            .read(extracted.join("meta/manifest.json"))
            .await?
            .ok_or_eyre("archive is missing its manifest")?;
        let manifest: CacheManifest =
            serde_json::from_slice(&manifest).context("parse cache manifest")?;

        let paths =
            super::restore_entries(fs, &self.package, &manifest, &extracted.join("files")).await?;

        let stdout = fs
            .read(extracted.join("meta/stdout"))
            .await?
            .unwrap_or_default();
        let stderr = fs
            .read(extracted.join("meta/stderr"))
            .await?
            .unwrap_or_default();
        Ok(RestoredOutput {
            paths,
            replay: Replay { stdout, stderr },
        })
    }
}

/// Write a zstd-compressed tarball of the manifest's entries.
///
/// Archive layout: `meta/manifest.json`, `meta/stdout`, `meta/stderr`, and
/// `files/<entry path>` for regular files. Directories and symlinks travel
/// in the manifest, not as archive members, so unpacking never follows a
/// link.
async fn build_archive(
    package: &Path,
    manifest: &CacheManifest,
    replay: &Replay,
    archive_path: &Path,
) -> Result<()> {
    let file = tokio::fs::File::create(archive_path)
        .await
        .context("create archive file")?;
    let mut encoder = ZstdEncoder::new(file);

    {
        let mut builder = async_tar::Builder::new((&mut encoder).compat_write());

        let manifest_bytes = serde_json::to_vec(manifest).context("serialize cache manifest")?;
        append_file(&mut builder, "meta/manifest.json", &manifest_bytes).await?;
        append_file(&mut builder, "meta/stdout", &replay.stdout).await?;
        append_file(&mut builder, "meta/stderr", &replay.stderr).await?;

        for entry in &manifest.entries {
            if entry.kind != EntryKind::File {
                continue;
            }
            let src = package.join(&entry.path);
            let file = tokio::fs::File::open(&src)
                .await
                .with_context(|| format!("open output file: {src:?}"))?;
            let mut header = async_tar::Header::new_gnu();
            header.set_size(entry.size.unwrap_or(0));
            header.set_mode(if entry.executable { 0o755 } else { 0o644 });
            header.set_cksum();
            builder
                .append_data(
                    &mut header,
                    Path::new("files").join(&entry.path),
                    file.compat(),
                )
                .await
                .context("append file to archive")?;
        }

        builder.into_inner().await.context("finalize tarball")?;
    }

    encoder.shutdown().await.context("flush zstd encoder")?;
    let mut file = encoder.into_inner();
    file.flush().await.context("flush archive file")?;
    Ok(())
}

async fn append_file<W>(
    builder: &mut async_tar::Builder<W>,
    path: &str,
    content: &[u8],
) -> Result<()>
where
    W: futures::AsyncWrite + Unpin + Send + Sync,
{
    let mut header = async_tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, content)
        .await
        .with_context(|| format!("append {path} to archive"))
}

/// Unpack a downloaded archive, sniffing zstd vs. gzip from its magic bytes.
async fn unpack_archive(archive_path: &Path, dst: &Path) -> Result<()> {
    let mut file = tokio::fs::File::open(archive_path)
        .await
        .context("open downloaded archive")?;
    let mut magic = [0u8; 4];
    let read = file.read(&mut magic).await.context("read archive magic")?;
    drop(file);

    let file = tokio::fs::File::open(archive_path)
        .await
        .context("open downloaded archive")?;
    let reader = BufReader::new(file);
    if read >= 4 && magic == ZSTD_MAGIC {
        unpack_tar(ZstdDecoder::new(reader), dst).await
    } else if read >= 2 && magic[..2] == GZIP_MAGIC {
        unpack_tar(GzipDecoder::new(reader), dst).await
    } else {
        // Uncompressed tar, the degenerate fallback.
        unpack_tar(BufReader::new(
            tokio::fs::File::open(archive_path)
                .await
                .context("open downloaded archive")?,
        ), dst)
        .await
    }
}

async fn unpack_tar<R>(reader: R, dst: &Path) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + Sync,
{
    use futures::StreamExt as _;

    tokio::fs::create_dir_all(dst)
        .await
        .context("create extraction directory")?;
    let archive = async_tar::Archive::new(reader.compat());
    let mut entries = archive.entries().context("read archive entries")?;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context("read archive entry")?;
        entry.unpack_in(dst).await.context("unpack archive entry")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManifestEntry;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn archive_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let package = temp.path().join("pkg");
        std::fs::create_dir_all(package.join("out")).unwrap();
        std::fs::write(package.join("out/a.txt"), "hello").unwrap();

        let manifest = CacheManifest {
            entries: vec![
                ManifestEntry {
                    path: "out".into(),
                    kind: EntryKind::Dir,
                    size: None,
                    link: None,
                    executable: false,
                },
                ManifestEntry {
                    path: "out/a.txt".into(),
                    kind: EntryKind::File,
                    size: Some(5),
                    link: None,
                    executable: false,
                },
            ],
        };
        let replay = Replay {
            stdout: b"ran\n".to_vec(),
            stderr: Vec::new(),
        };

        let archive_path = temp.path().join("entry.tar.zst");
        build_archive(&package, &manifest, &replay, &archive_path)
            .await
            .unwrap();

        // The archive must carry the zstd magic.
        let head = std::fs::read(&archive_path).unwrap();
        assert_eq!(&head[..4], &ZSTD_MAGIC);

        let extracted = temp.path().join("extracted");
        unpack_archive(&archive_path, &extracted).await.unwrap();

        let roundtrip: CacheManifest = serde_json::from_slice(
            &std::fs::read(extracted.join("meta/manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(roundtrip, manifest);
        assert_eq!(
            std::fs::read_to_string(extracted.join("files/out/a.txt")).unwrap(),
            "hello"
        );
        assert_eq!(std::fs::read(extracted.join("meta/stdout")).unwrap(), b"ran\n");
    }
}
