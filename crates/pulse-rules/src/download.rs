//! The rules downloader: conditional-GET fetch with a durable cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use pulse_store::NamedCollection;

use crate::error::RulesError;

/// Collection that holds one cache entry per rules URL.
pub const CACHE_COLLECTION: &str = "rules.cache";

/// Decodes a downloaded rules archive into the `rules.json` bytes.
///
/// Archive decoding is a collaborator concern; the downloader only defines
/// the seam. `scratch` is a private directory the extractor may unpack
/// into.
pub trait ArchiveExtractor: Send + Sync {
    /// Extracts the rule document bytes from `archive`.
    ///
    /// # Errors
    ///
    /// Returns `RulesError::Unzip` when the archive is unusable.
    fn extract_rules(&self, archive: &[u8], scratch: &Path) -> Result<Vec<u8>, RulesError>;
}

/// Extractor for endpoints that serve the rule document directly, with no
/// archive wrapper. Also the test extractor.
pub struct PassthroughExtractor;

impl ArchiveExtractor for PassthroughExtractor {
    fn extract_rules(&self, archive: &[u8], _scratch: &Path) -> Result<Vec<u8>, RulesError> {
        Ok(archive.to_vec())
    }
}

/// One cache entry, stored under `base64(url)`.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    /// The extracted rule document, base64-encoded.
    body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

/// Fetches rule archives with `If-Modified-Since` / `If-None-Match`
/// revalidation.
///
/// A `304` serves the cached body; a `200` replaces the cache entry; any
/// network or extraction failure leaves the cache untouched and yields
/// `None`.
pub struct RulesDownloader {
    client: reqwest::Client,
    cache: NamedCollection,
    extractor: Arc<dyn ArchiveExtractor>,
    scratch: PathBuf,
}

impl RulesDownloader {
    /// Creates a downloader over `cache` (a [`NamedCollection`], typically
    /// `rules.cache`) using `scratch` for archive unpacking.
    pub fn new(
        cache: NamedCollection,
        extractor: Arc<dyn ArchiveExtractor>,
        scratch: PathBuf,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache,
            extractor,
            scratch,
        }
    }

    /// Fetches the rules at `url`, revalidating any cached copy. Returns
    /// the rule document bytes, or `None` when nothing usable could be
    /// produced.
    pub async fn load_from_url(&self, url: &str) -> Option<Vec<u8>> {
        let key = BASE64.encode(url);
        let cached = self.cache_entry(&key);

        let mut request = self.client.get(url);
        if let Some(entry) = &cached {
            if let Some(last_modified) = &entry.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
            if let Some(etag) = &entry.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url, error = %e, "rules download failed");
                return None;
            }
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                tracing::debug!(url, "rules not modified, serving cached copy");
                cached.and_then(|entry| BASE64.decode(entry.body).ok())
            }
            status if status.is_success() => {
                let last_modified = header_string(&response, LAST_MODIFIED);
                let etag = header_string(&response, ETAG);

                let archive = match response.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(url, error = %e, "failed to read rules body");
                        return None;
                    }
                };

                let rules = match self.extractor.extract_rules(&archive, &self.scratch) {
                    Ok(rules) => rules,
                    Err(e) => {
                        tracing::warn!(url, error = %e, "failed to extract rules archive");
                        return None;
                    }
                };

                let entry = CacheEntry {
                    body: BASE64.encode(&rules),
                    last_modified,
                    etag,
                };
                if let Err(e) = self.cache.set(&key, json!(entry)) {
                    tracing::warn!(url, error = %e, "failed to write rules cache");
                }

                Some(rules)
            }
            status => {
                tracing::warn!(url, %status, "unexpected rules download status");
                None
            }
        }
    }

    /// Serves the cached rules for `url` without any network traffic.
    pub fn load_cached(&self, url: &str) -> Option<Vec<u8>> {
        let key = BASE64.encode(url);
        self.cache_entry(&key)
            .and_then(|entry| BASE64.decode(entry.body).ok())
    }

    fn cache_entry(&self, key: &str) -> Option<CacheEntry> {
        let value = self.cache.get(key)?;
        match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "corrupt rules cache entry ignored");
                None
            }
        }
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
