//! Flat-table storage, raw export archiving and retrying HTTP access for GIATAR.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "giatar-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Parsed CSV with the header row kept for schema checks.
#[derive(Debug, Clone)]
pub struct CsvTable<T> {
    pub headers: Vec<String>,
    pub rows: Vec<T>,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: String,
}

/// Rows that fail to deserialize are collected in `rejected`; only an unreadable
/// header row is an error.
pub fn parse_csv<T: DeserializeOwned>(bytes: &[u8]) -> Result<CsvTable<T>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();
    reader.set_headers(csv::StringRecord::from(headers.clone()));

    let mut rows = Vec::new();
    let mut rejected = Vec::new();
    for result in reader.deserialize::<T>() {
        match result {
            Ok(row) => rows.push(row),
            Err(err) => rejected.push(RejectedRow {
                line: err.position().map(|p| p.line()).unwrap_or_default(),
                reason: err.to_string(),
            }),
        }
    }
    Ok(CsvTable {
        headers,
        rows,
        rejected,
    })
}

pub fn encode_csv<T: Serialize>(rows: &[T]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("serializing csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv buffer: {}", err.error()))
}

/// Root of the data directory. All writes go through temp-file + rename.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn archive_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from("archive")
            .join(stamp)
            .join(source)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archive a raw source export under a hash-addressed path. Identical bytes are stored once.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.archive_relative_path(fetched_at, source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch {
            root: self.root.clone(),
            files: Vec::new(),
        }
    }

    pub async fn write_bytes(&self, relative: impl AsRef<Path>, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.root.join(relative);
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    pub async fn write_table<T: Serialize>(
        &self,
        relative: impl AsRef<Path>,
        rows: &[T],
    ) -> anyhow::Result<PathBuf> {
        let relative = relative.as_ref();
        let bytes = encode_csv(rows).with_context(|| format!("encoding {}", relative.display()))?;
        self.write_bytes(relative, &bytes).await
    }

    /// Reads a table the pipeline wrote itself. A missing file is an empty table;
    /// an undecodable row is an error because it means the file was corrupted.
    pub async fn read_rows<T: DeserializeOwned>(&self, relative: impl AsRef<Path>) -> anyhow::Result<Vec<T>> {
        let path = self.root.join(relative);
        let Some(bytes) = read_if_exists(&path).await? else {
            return Ok(Vec::new());
        };
        let table = parse_csv::<T>(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(first) = table.rejected.first() {
            anyhow::bail!(
                "{} has {} undecodable rows (first at line {}: {})",
                path.display(),
                table.rejected.len(),
                first.line,
                first.reason
            );
        }
        Ok(table.rows)
    }

    pub async fn read_json<T: DeserializeOwned>(&self, relative: impl AsRef<Path>) -> anyhow::Result<Option<T>> {
        let path = self.root.join(relative);
        let Some(bytes) = read_if_exists(&path).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    pub async fn write_json<T: Serialize>(&self, relative: impl AsRef<Path>, value: &T) -> anyhow::Result<PathBuf> {
        let relative = relative.as_ref();
        let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {}", relative.display()))?;
        self.write_bytes(relative, &bytes).await
    }
}

async fn read_if_exists(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Write through a sibling temp file so readers never observe a partial table.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = stage_file(path, bytes).await?;
    commit_staged(&temp_path, path).await
}

async fn stage_file(path: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }
    Ok(temp_path)
}

async fn commit_staged(temp_path: &Path, path: &Path) -> anyhow::Result<()> {
    if let Err(err) = fs::rename(temp_path, path).await {
        let _ = fs::remove_file(temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Files that change together. Nothing is renamed into place until every file
/// has been staged next to its target, so a failed staging write leaves all
/// targets as they were.
#[derive(Debug)]
pub struct WriteBatch {
    root: PathBuf,
    files: Vec<(PathBuf, Vec<u8>)>,
}

impl WriteBatch {
    pub fn table<T: Serialize>(&mut self, relative: impl AsRef<Path>, rows: &[T]) -> anyhow::Result<()> {
        let relative = relative.as_ref();
        let bytes = encode_csv(rows).with_context(|| format!("encoding {}", relative.display()))?;
        self.files.push((self.root.join(relative), bytes));
        Ok(())
    }

    /// `path` is taken as is when absolute, else relative to the store root.
    pub fn bytes(&mut self, path: impl AsRef<Path>, bytes: Vec<u8>) {
        self.files.push((self.root.join(path), bytes));
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub async fn commit(self) -> anyhow::Result<Vec<PathBuf>> {
        let mut staged = Vec::with_capacity(self.files.len());
        for (path, bytes) in &self.files {
            match stage_file(path, bytes).await {
                Ok(temp_path) => staged.push((temp_path, path.clone())),
                Err(err) => {
                    for (temp_path, _) in &staged {
                        let _ = fs::remove_file(temp_path).await;
                    }
                    return Err(err.context(format!("staging {}", path.display())));
                }
            }
        }
        let mut written = Vec::with_capacity(staged.len());
        for (temp_path, path) in staged {
            commit_staged(&temp_path, &path).await?;
            written.push(path);
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub trait Classify {
    fn disposition(&self) -> RetryDisposition;
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-delay retries around one external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first call, so a call is made at most `retries + 1` times.
    pub retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_secs(5))
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display> {
    #[error("{operation} gave up after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: usize,
        last: E,
    },
    #[error("{operation} failed: {error}")]
    Permanent { operation: String, error: E },
}

impl<E: fmt::Display> RetryError<E> {
    /// Exhausted retries leave the item eligible for the next run.
    pub fn is_transient(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(retries: usize, delay: Duration) -> Self {
        Self { retries, delay }
    }

    pub fn max_attempts(&self) -> usize {
        self.retries.saturating_add(1)
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or retries run out.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.disposition() == RetryDisposition::NonRetryable => {
                    return Err(RetryError::Permanent {
                        operation: operation.to_string(),
                        error: err,
                    });
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(RetryError::Exhausted {
                            operation: operation.to_string(),
                            attempts,
                            last: err,
                        });
                    }
                    let delay = self.delay;
                    warn!(operation, attempt, error = %err, ?delay, "transient failure; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Classify for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::Retryable,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
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
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn get_once(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, RetryError<FetchError>> {
        let span = info_span!("http_fetch", url);
        self.retry
            .run(url, move || async move {
                let resp = self.get_once(url, query).await?;
                serde_json::from_slice::<T>(&resp.body).map_err(|source| FetchError::Decode {
                    url: resp.final_url.clone(),
                    source,
                })
            })
            .instrument(span)
            .await
    }
}
