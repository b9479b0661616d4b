//! Wire types for the GitHub Actions cache v1 ("artifactcache") API.
//!
//! The protocol is a reserve-then-upload-then-commit scheme:
//! 1. `GET /_apis/artifactcache/cache?keys=K&version=V` looks up an entry;
//!    a hit returns a pre-signed `archiveLocation` URL, a miss returns 204.
//! 2. `POST /_apis/artifactcache/caches` reserves an upload slot and returns
//!    a `cacheId`.
//! 3. `PATCH /_apis/artifactcache/caches/{cacheId}` uploads the archive in
//!    `Content-Range`-addressed chunks.
//! 4. `POST /_apis/artifactcache/caches/{cacheId}` with the total size
//!    commits the entry.

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::Client;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The `api-version` negotiated with the service on every request.
pub const API_VERSION: &str = "application/json;api-version=6.0-preview.1";

/// Identifier of a reserved (but not yet committed) cache upload.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct CacheId(pub i64);

/// Response to a cache lookup.
///
/// Note that `archive_location` is a pre-signed URL: it embeds credentials
/// and must never be logged. It is deserialized into a plain `String` (not
/// `url::Url`) so that the types crate stays dependency-light; the client
/// parses it at the point of use.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheLookupResponse {
    #[serde(default)]
    pub cache_key: Option<String>,
    pub archive_location: String,
}

/// Request to reserve an upload slot for a cache entry.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveCacheRequest {
    pub key: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<u64>,
}

/// Response to a successful reservation.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveCacheResponse {
    pub cache_id: CacheId,
}

/// Request finalizing an upload.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitCacheRequest {
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lookup_response_parses_service_shape() {
        let body = r#"{"cacheKey":"wireit-abc","archiveLocation":"https://example.test/signed"}"#;
        let parsed = serde_json::from_str::<CacheLookupResponse>(body).unwrap();
        assert_eq!(parsed.cache_key.as_deref(), Some("wireit-abc"));
        assert_eq!(parsed.archive_location, "https://example.test/signed");
    }

    #[test]
    fn reserve_request_omits_absent_size() {
        let request = ReserveCacheRequest {
            key: "k".into(),
            version: "v".into(),
            cache_size: None,
        };
        let body = serde_json::to_string(&request).unwrap();
        assert_eq!(body, r#"{"key":"k","version":"v"}"#);
    }
}
