//! Revalidating on-disk HTTP cache for LMO source documents.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lmo-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Per-request timeout. Fixed; a request exceeding it is a transport failure.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: REQUEST_TIMEOUT,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

/// Cache validators sent as `If-None-Match` / `If-Modified-Since`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_conditional(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Message(String),
}

/// Issues a single GET. Implementations never retry.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn header_text(
    headers: &reqwest::header::HeaderMap,
    name: reqwest::header::HeaderName,
) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.get(url);
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let etag = header_text(resp.headers(), ETAG);
        let last_modified = header_text(resp.headers(), LAST_MODIFIED);
        let body = if status == StatusCode::OK {
            resp.bytes().await?.to_vec()
        } else {
            Vec::new()
        };

        Ok(TransportResponse {
            status: status.as_u16(),
            etag,
            last_modified,
            body,
        })
    }
}

/// Persisted validator record, one per cached URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(
        default,
        rename = "last-modified",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    /// Full body received and written to the cache.
    Downloaded,
    /// Server answered 304; the cached body was reused.
    NotModified,
    /// Request failed; the previously cached body was served instead.
    StaleFallback,
}

#[derive(Debug, Clone)]
pub struct CachedFetch {
    pub url: String,
    pub outcome: FetchOutcome,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("cache io on {}: {source}", .path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding cache metadata for {url}: {source}")]
    Metadata {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Byte cache keyed by URL hash. Entries never expire; they are revalidated.
#[derive(Clone)]
pub struct CacheStore {
    root: PathBuf,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").field("root", &self.root).finish()
    }
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            root: root.into(),
            transport,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn cache_key(url: &str) -> String {
        Self::sha256_hex(url.as_bytes())
    }

    pub fn metadata_path(&self, url: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::cache_key(url)))
    }

    pub fn content_path(&self, url: &str) -> PathBuf {
        self.root.join(format!("{}.html", Self::cache_key(url)))
    }

    /// Fetches `url`, revalidating any cached copy and falling back to it on failure.
    pub async fn fetch(&self, source_id: &str, url: &str) -> Result<CachedFetch, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_inner(url).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str) -> Result<CachedFetch, FetchError> {
        let metadata = self.load_metadata(url).await?;
        let cached = read_optional(&self.content_path(url)).await?;

        // Validators without a body to fall back on would turn a 304 into a dead end.
        let validators = match (&metadata, &cached) {
            (Some(meta), Some(_)) => Validators {
                etag: meta.etag.clone(),
                last_modified: meta.last_modified.clone(),
            },
            _ => Validators::default(),
        };

        let failure = match self.transport.get(url, &validators).await {
            Ok(resp) if resp.status == StatusCode::NOT_MODIFIED.as_u16() => match cached {
                Some(body) => {
                    info!(bytes = body.len(), "not modified, serving cached body");
                    return Ok(CachedFetch {
                        url: url.to_string(),
                        outcome: FetchOutcome::NotModified,
                        body,
                    });
                }
                None => FetchError::HttpStatus {
                    status: resp.status,
                    url: url.to_string(),
                },
            },
            Ok(resp) if resp.status == StatusCode::OK.as_u16() => {
                self.persist(url, &resp).await?;
                info!(
                    bytes = resp.body.len(),
                    conditional = validators.is_conditional(),
                    "downloaded"
                );
                return Ok(CachedFetch {
                    url: url.to_string(),
                    outcome: FetchOutcome::Downloaded,
                    body: resp.body,
                });
            }
            Ok(resp) => FetchError::HttpStatus {
                status: resp.status,
                url: url.to_string(),
            },
            Err(source) => FetchError::Transport {
                url: url.to_string(),
                source,
            },
        };

        match cached {
            Some(body) => {
                warn!(error = %failure, "fetch failed, serving stale cached body");
                Ok(CachedFetch {
                    url: url.to_string(),
                    outcome: FetchOutcome::StaleFallback,
                    body,
                })
            }
            None => Err(failure),
        }
    }

    async fn load_metadata(&self, url: &str) -> Result<Option<CacheMetadata>, FetchError> {
        let path = self.metadata_path(url);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<CacheMetadata>(&bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable cache metadata");
                Ok(None)
            }
        }
    }

    async fn persist(&self, url: &str, resp: &TransportResponse) -> Result<(), FetchError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| FetchError::CacheIo {
                path: self.root.clone(),
                source,
            })?;

        write_atomic(&self.content_path(url), &resp.body).await?;

        let meta = CacheMetadata {
            url: url.to_string(),
            etag: resp.etag.clone(),
            last_modified: resp.last_modified.clone(),
        };
        let meta_bytes = serde_json::to_vec(&meta).map_err(|source| FetchError::Metadata {
            url: url.to_string(),
            source,
        })?;
        write_atomic(&self.metadata_path(url), &meta_bytes).await
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, FetchError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(FetchError::CacheIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError {
    let path = path.to_path_buf();
    move |source| FetchError::CacheIo { path, source }
}

/// Write through a temp file in the same directory, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FetchError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(FetchError::CacheIo {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
