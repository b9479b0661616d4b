//! HTTP client for the GitHub Actions cache v1 API.

use std::sync::Arc;

use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::Debug;
use futures::TryStreamExt;
use reqwest::{Response, StatusCode, header};
use tap::Pipe;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{instrument, warn};
use url::Url;

use crate::{
    Token,
    github::v1::{
        API_VERSION, CacheId, CacheLookupResponse, CommitCacheRequest, ReserveCacheRequest,
        ReserveCacheResponse,
    },
};

/// Client for the GitHub Actions cache service.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
///
/// ## Secrecy
///
/// The service base URL and the pre-signed download URLs are credentials.
/// Errors produced by this client carry response statuses and bodies but
/// never URLs.
#[derive(Clone, Debug)]
pub struct Client {
    #[debug(skip)]
    base: Arc<Url>,

    #[debug(skip)]
    http: reqwest::Client,

    token: Token,
}

impl Client {
    /// Create a new client with the given service base URL and runtime token.
    pub fn new(base: Url, token: Token) -> Result<Self> {
        // `Url::join` treats a base without a trailing slash as a file and
        // replaces the last path segment, so normalize here once.
        let base = if base.path().ends_with('/') {
            base
        } else {
            let mut base = base;
            base.set_path(&format!("{}/", base.path()));
            base
        };

        let http = reqwest::Client::builder()
            .build()
            .context("build http client")?;

        Ok(Self {
            base: Arc::new(base),
            http,
            token,
        })
    }

    /// Look up a cache entry, returning the pre-signed archive URL on a hit.
    #[instrument(skip_all)]
    pub async fn lookup(&self, key: &str, version: &str) -> Result<Option<Url>> {
        let url = self.base.join("_apis/artifactcache/cache")?;
        let response = self
            .http
            .get(url)
            .query(&[("keys", key), ("version", version)])
            .header(header::ACCEPT, API_VERSION)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send")?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let body = response
                    .json::<CacheLookupResponse>()
                    .await
                    .context("parse JSON response")?;
                Url::parse(&body.archive_location)
                    .context("parse archive location")?
                    .pipe(Some)
                    .pipe(Ok)
            }
            status => Err(unexpected_status("lookup cache entry", status, response).await),
        }
    }

    /// Reserve an upload slot for a new cache entry.
    ///
    /// Returns `None` when the entry is already reserved or committed by
    /// another writer; the caller treats that as "someone else got there
    /// first" and moves on.
    #[instrument(skip_all)]
    pub async fn reserve(
        &self,
        key: &str,
        version: &str,
        cache_size: Option<u64>,
    ) -> Result<Option<CacheId>> {
        let url = self.base.join("_apis/artifactcache/caches")?;
        let response = self
            .http
            .post(url)
            .header(header::ACCEPT, API_VERSION)
            .bearer_auth(self.token.expose())
            .json(&ReserveCacheRequest {
                key: key.to_owned(),
                version: version.to_owned(),
                cache_size,
            })
            .send()
            .await
            .context("send")?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => response
                .json::<ReserveCacheResponse>()
                .await
                .context("parse JSON response")?
                .cache_id
                .pipe(Some)
                .pipe(Ok),
            StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS => {
                warn!(%key, "cache entry already reserved elsewhere");
                Ok(None)
            }
            status => Err(unexpected_status("reserve cache entry", status, response).await),
        }
    }

    /// Upload one chunk of the archive at the given byte offset.
    #[instrument(skip(self, chunk), fields(len = chunk.len()))]
    pub async fn upload_chunk(&self, id: CacheId, offset: u64, chunk: Vec<u8>) -> Result<()> {
        let url = self.base.join(&format!("_apis/artifactcache/caches/{id}"))?;
        let end = offset + chunk.len() as u64 - 1;
        let response = self
            .http
            .patch(url)
            .header(header::ACCEPT, API_VERSION)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_RANGE, format!("bytes {offset}-{end}/*"))
            .bearer_auth(self.token.expose())
            .body(chunk)
            .send()
            .await
            .context("send")?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(unexpected_status("upload cache chunk", status, response).await),
        }
    }

    /// Commit a fully-uploaded cache entry.
    #[instrument(skip(self))]
    pub async fn commit(&self, id: CacheId, size: u64) -> Result<()> {
        let url = self.base.join(&format!("_apis/artifactcache/caches/{id}"))?;
        let response = self
            .http
            .post(url)
            .header(header::ACCEPT, API_VERSION)
            .bearer_auth(self.token.expose())
            .json(&CommitCacheRequest { size })
            .send()
            .await
            .context("send")?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(unexpected_status("commit cache entry", status, response).await),
        }
    }

    /// Download a cached archive from its pre-signed URL into `writer`.
    ///
    /// Returns the total number of bytes written. The pre-signed URL embeds
    /// its own credentials, so no authorization header is attached.
    #[instrument(skip_all)]
    pub async fn download_to(
        &self,
        archive: Url,
        writer: &mut (impl AsyncWrite + Unpin),
    ) -> Result<u64> {
        let response = self.http.get(archive).send().await.context("send")?;
        let status = response.status();
        if !status.is_success() {
            return Err(unexpected_status("download cache archive", status, response).await);
        }

        let mut total = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.try_next().await.context("read response chunk")? {
            writer.write_all(&chunk).await.context("write chunk")?;
            total += chunk.len() as u64;
        }
        writer.flush().await.context("flush writer")?;
        Ok(total)
    }
}

/// Build an error for a response with an unexpected status.
///
/// Deliberately omits the request URL: cache URLs are credentials.
async fn unexpected_status(
    action: &'static str,
    status: StatusCode,
    response: Response,
) -> color_eyre::Report {
    let body = response.text().await.unwrap_or_default();
    eyre!("{action}: unexpected status code: {status}").section(body.header("Body:"))
}
