//! HTTP fetching into the local cache, with optional percentage progress.

use crate::error::{PkgError, Result};
use crate::models::{validate_package_name, ARCHIVE_EXTENSION};
use bap_core::BapConfig;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Write buffer size; bounds how much of a transfer is held in memory.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Turns byte counts into rate-limited percentage updates.
///
/// `start` reports 0, `advance` reports at most once per `interval`, and
/// `finish` always reports a final 100 unless 100 was the last value sent.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    transferred: u64,
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total: u64, interval: Duration) -> Self {
        Self {
            total,
            transferred: 0,
            interval,
            last_emit: None,
            last_percent: None,
        }
    }

    pub fn start(&mut self, now: Instant) -> u8 {
        self.emit(now)
    }

    pub fn advance(&mut self, bytes: u64, now: Instant) -> Option<u8> {
        self.transferred = self.transferred.saturating_add(bytes);
        let due = match self.last_emit {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        due.then(|| self.emit(now))
    }

    pub fn finish(&mut self, now: Instant) -> Option<u8> {
        self.transferred = self.transferred.max(self.total);
        (self.last_percent != Some(100)).then(|| self.emit(now))
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.transferred.min(self.total) * 100 / self.total) as u8
    }

    fn emit(&mut self, now: Instant) -> u8 {
        let percent = self.percent();
        self.last_emit = Some(now);
        self.last_percent = Some(percent);
        percent
    }
}

pub fn http_client(config: &BapConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.download.timeout())
        .build()
        .map_err(|e| PkgError::DownloadFailed {
            url: String::new(),
            reason: format!("failed to build HTTP client: {}", e),
        })
}

/// Fetches package archives into the cache directory.
pub struct Downloader {
    client: reqwest::Client,
    cache_dir: PathBuf,
    progress_interval: Duration,
}

impl Downloader {
    pub fn new(config: &BapConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            cache_dir: config.paths.cache_dir.clone(),
            progress_interval: config.download.progress_interval(),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Cache location of a package's archive. Names that would leave the
    /// cache directory are rejected.
    pub fn archive_path(&self, name: &str) -> Result<PathBuf> {
        let name = validate_package_name(name)?;
        Ok(self.cache_dir.join(format!("{}{}", name, ARCHIVE_EXTENSION)))
    }

    /// Download `url` as the cached archive of `name`.
    ///
    /// With `progress`, percentages are sent on the channel; a server that
    /// does not report a content length then fails with
    /// [`PkgError::LengthUnknown`].
    pub async fn download(
        &self,
        name: &str,
        url: &str,
        progress: Option<mpsc::Sender<u8>>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let dest = self.archive_path(name)?;
        tracing::info!("Downloading {} from {}", name, url);
        let bytes = fetch(&self.client, url, &dest, progress, self.progress_interval, cancel).await?;
        tracing::info!("Downloaded {} ({} bytes) to {:?}", name, bytes, dest);
        Ok(dest)
    }
}

/// Stream `url` into `dest` via a `.part` sibling that is renamed on success.
///
/// On cancellation the partial file is flushed and left in place.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    progress: Option<mpsc::Sender<u8>>,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<u64> {
    let failed = |reason: String| PkgError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PkgError::Cancelled(url.to_string())),
        response = client.get(url).send() => response.map_err(|e| failed(e.to_string()))?,
    };
    let response = response.error_for_status().map_err(|e| failed(e.to_string()))?;
    let total = response.content_length();

    let mut tracker = match (&progress, total) {
        (Some(_), None) => return Err(PkgError::LengthUnknown(url.to_string())),
        (Some(_), Some(total)) => Some(ProgressTracker::new(total, interval)),
        (None, _) => None,
    };
    let report = |percent: u8| {
        let sender = progress.clone();
        async move {
            if let Some(sender) = sender {
                // A receiver that went away only stops reporting.
                let _ = sender.send(percent).await;
            }
        }
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(dest);
    let file = tokio::fs::File::create(&part).await?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);

    if let Some(tracker) = tracker.as_mut() {
        report(tracker.start(Instant::now())).await;
    }

    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                writer.flush().await?;
                tracing::warn!("Download of {} cancelled after {} bytes, partial file {:?}", url, written, part);
                return Err(PkgError::Cancelled(url.to_string()));
            }
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| failed(e.to_string()))?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if let Some(tracker) = tracker.as_mut() {
            if let Some(percent) = tracker.advance(chunk.len() as u64, Instant::now()) {
                report(percent).await;
            }
        }
    }
    writer.flush().await?;
    drop(writer);

    if let Some(total) = total {
        if written != total {
            return Err(failed(format!("expected {} bytes, received {}", total, written)));
        }
    }
    tokio::fs::rename(&part, dest).await?;

    if let Some(tracker) = tracker.as_mut() {
        if let Some(percent) = tracker.finish(Instant::now()) {
            report(percent).await;
        }
    }
    Ok(written)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
