// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer executor: streams a resolved URL into a temporary file.
//!
//! The body is regrouped into fixed-size chunks. Before each chunk is written
//! the job's [`ProgressSink`] is asked whether the job is still live, and
//! after each write it receives the new percentage. Cancellation therefore
//! takes effect at the next chunk boundary, after any in-flight read or write
//! has completed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{Stream, StreamExt};
use reqwest::header::{CONTENT_ENCODING, REFERER, USER_AGENT};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use super::registry::DownloadRegistry;
use super::types::JobId;
use crate::storage::discard_temp;

/// Default chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Receives per-chunk progress and answers whether the job is still wanted.
pub trait ProgressSink: Send + Sync {
    /// Returns true once the job has been cancelled.
    fn is_cancelled(&self) -> bool;

    /// Report progress after a chunk write. Returns false if the job is gone.
    fn report(&self, percent: u8) -> bool;
}

/// Cancellation context for one job: its id plus the registry it lives in.
///
/// A job is cancelled exactly when its registry entry has been removed.
#[derive(Debug, Clone)]
pub struct CancelContext {
    id: JobId,
    registry: Arc<DownloadRegistry>,
}

impl CancelContext {
    pub fn new(id: JobId, registry: Arc<DownloadRegistry>) -> Self {
        Self { id, registry }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }
}

impl ProgressSink for CancelContext {
    fn is_cancelled(&self) -> bool {
        !self.registry.contains(&self.id)
    }

    fn report(&self, percent: u8) -> bool {
        self.registry.update(&self.id, percent)
    }
}

/// How a transfer ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferReport {
    /// Every advertised byte was written.
    Completed { bytes: u64 },
    /// The sink reported cancellation. The temp file has been removed.
    Cancelled { bytes: u64 },
}

/// Settings for outgoing transfer requests.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub user_agent: String,
    pub referer: Option<String>,
    /// Bounds connecting and each wait for more body bytes, not the whole
    /// transfer.
    pub timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            user_agent: "Mozilla/5.0".to_string(),
            referer: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Performs streamed downloads.
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    client: reqwest::Client,
    settings: TransferSettings,
}

impl TransferExecutor {
    pub fn new(settings: TransferSettings) -> anyhow::Result<Self> {
        // Idle per read, so large books on slow links still finish.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout)
            .read_timeout(settings.timeout)
            .build()
            .context("Failed to build transfer client")?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Download `url` into `dest`, overwriting any stale file there.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<TransferReport, DownloadError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, &self.settings.user_agent);
        if let Some(referer) = &self.settings.referer {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Transfer(format!(
                "mirror answered HTTP {}",
                response.status()
            )));
        }

        // A compressed body's length says nothing about the bytes we write.
        let total = match response.content_length() {
            Some(total) if !response.headers().contains_key(CONTENT_ENCODING) => total,
            _ => return Err(DownloadError::Transfer("unknown size".to_string())),
        };

        tracing::debug!(url = %url, total, "Starting transfer");
        stream_to_file(
            response.bytes_stream(),
            total,
            dest,
            self.settings.chunk_size,
            self.settings.timeout,
            sink,
        )
        .await
    }
}

/// Write `stream` into `dest` in `chunk_size` pieces, reporting progress.
///
/// A stream that yields nothing for `idle_timeout` fails the transfer. On
/// cancellation or error the partially written file is removed.
pub async fn stream_to_file<S, B, E>(
    stream: S,
    total: u64,
    dest: &Path,
    chunk_size: usize,
    idle_timeout: Duration,
    sink: &dyn ProgressSink,
) -> Result<TransferReport, DownloadError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let result = copy_chunks(stream, total, dest, chunk_size.max(1), idle_timeout, sink).await;
    match &result {
        Ok(TransferReport::Completed { .. }) => {}
        Ok(TransferReport::Cancelled { .. }) | Err(_) => discard_temp(dest).await,
    }
    result
}

async fn copy_chunks<S, B, E>(
    stream: S,
    total: u64,
    dest: &Path,
    chunk_size: usize,
    idle_timeout: Duration,
    sink: &dyn ProgressSink,
) -> Result<TransferReport, DownloadError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    // File::create truncates a stale file from an earlier run.
    let mut file = File::create(dest).await?;
    let mut writer = ChunkWriter {
        file: &mut file,
        total,
        written: 0,
        sink,
    };

    let mut stream = std::pin::pin!(stream);
    let mut pending: Vec<u8> = Vec::with_capacity(chunk_size);

    loop {
        let piece = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(piece)) => piece,
            Ok(None) => break,
            Err(_) => {
                return Err(DownloadError::Transfer(format!(
                    "no data received for {:?}",
                    idle_timeout
                )))
            }
        };
        let piece = piece.map_err(|e| DownloadError::Transfer(e.to_string()))?;
        let mut piece = piece.as_ref();

        while !piece.is_empty() {
            let take = (chunk_size - pending.len()).min(piece.len());
            pending.extend_from_slice(&piece[..take]);
            piece = &piece[take..];

            if pending.len() == chunk_size {
                if !writer.write_chunk(&pending).await? {
                    return Ok(TransferReport::Cancelled {
                        bytes: writer.written,
                    });
                }
                pending.clear();
            }
        }
    }

    if !pending.is_empty() && !writer.write_chunk(&pending).await? {
        return Ok(TransferReport::Cancelled {
            bytes: writer.written,
        });
    }

    let written = writer.written;
    file.flush().await?;
    file.sync_all().await?;

    if written < total {
        return Err(DownloadError::Transfer(format!(
            "body ended after {} of {} bytes",
            written, total
        )));
    }
    // Zero-length bodies never write a chunk.
    if total == 0 && !sink.report(100) {
        return Ok(TransferReport::Cancelled { bytes: 0 });
    }

    Ok(TransferReport::Completed { bytes: written })
}

struct ChunkWriter<'a> {
    file: &'a mut File,
    total: u64,
    written: u64,
    sink: &'a dyn ProgressSink,
}

impl ChunkWriter<'_> {
    /// Write one chunk. Returns false if the job was cancelled.
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<bool, DownloadError> {
        if self.sink.is_cancelled() {
            return Ok(false);
        }
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(self.sink.report(percent_of(self.written, self.total)))
    }
}

/// `written / total` as a percentage in 0..=100.
pub fn percent_of(written: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((written.min(total) as u128 * 100) / total as u128) as u8
}
