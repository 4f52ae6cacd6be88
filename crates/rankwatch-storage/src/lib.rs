//! Snapshot persistence + HTTP page fetch utilities for rankwatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use rankwatch_core::Snapshot;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no snapshot stored at {}", path.display())]
    Unavailable { path: PathBuf },
    #[error("snapshot i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding snapshot {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What the cached snapshot was read from; a change means the file was rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        }
    }
}

#[derive(Debug)]
struct CachedSnapshot {
    stamp: FileStamp,
    snapshot: Arc<Snapshot>,
}

/// Single-slot JSON snapshot file with an in-memory copy.
///
/// The cached copy is reused while the file's modification time and length
/// are unchanged, and is reloaded otherwise. Single writer only.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    cache: Mutex<Option<CachedSnapshot>>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn stamp(&self) -> Result<FileStamp, StoreError> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(FileStamp::from_metadata(&meta)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::Unavailable {
                path: self.path.clone(),
            }),
            Err(err) => Err(StoreError::io(&self.path, err)),
        }
    }

    /// Previously saved snapshot; `StoreError::Unavailable` when nothing was saved yet.
    pub async fn load_previous(&self) -> Result<Arc<Snapshot>, StoreError> {
        let stamp = self.stamp().await?;
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.stamp == stamp {
                return Ok(Arc::clone(&cached.snapshot));
            }
            debug!(path = %self.path.display(), "snapshot file changed on disk; reloading");
        }

        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Unavailable {
                    path: self.path.clone(),
                })
            }
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        let snapshot: Snapshot = serde_json::from_str(&text).map_err(|source| StoreError::Decode {
            path: self.path.clone(),
            source,
        })?;
        let snapshot = Arc::new(snapshot);
        *cache = Some(CachedSnapshot {
            stamp,
            snapshot: Arc::clone(&snapshot),
        });
        Ok(snapshot)
    }

    /// Replace the stored snapshot with a temp-file write and rename, then refresh the cache.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StoreError::io(&parent, err))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = write_new_file(&temp_path, &bytes).await;
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&temp_path, err));
        }
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&self.path, err));
        }

        let stamp = self.stamp().await?;
        *self.cache.lock().await = Some(CachedSnapshot {
            stamp,
            snapshot: Arc::new(snapshot.clone()),
        });
        debug!(path = %self.path.display(), programs = snapshot.len(), "snapshot saved");
        Ok(())
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
    pub content_hash: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot page fetcher; a failed request is retried only by the next cycle.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
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

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_text_inner(url).instrument(span).await
    }

    async fn fetch_text_inner(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.text().await?;
        let content_hash = sha256_hex(body.as_bytes());
        debug!(%status, bytes = body.len(), %content_hash, "page fetched");
        Ok(FetchedPage {
            status,
            final_url,
            body,
            content_hash,
        })
    }
}
