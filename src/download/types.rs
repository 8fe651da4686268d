// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types: job identity, requests, status and outcomes.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::error::DownloadError;
use crate::classify::ContentKind;
use crate::storage::sanitize_filename;

/// Longest accepted extension hint.
const MAX_KIND_HINT_LEN: usize = 10;

/// Opaque job identifier: 128 random bits as 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        JobId(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// What a client asks for when starting a download.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// External content identifier (the md5 from the search results).
    pub content_key: String,
    /// Title the stored file is named after.
    pub title: String,
    /// Optional extension hint.
    pub preferred_kind: Option<String>,
}

impl DownloadRequest {
    pub fn new(
        content_key: impl Into<String>,
        title: impl Into<String>,
        preferred_kind: Option<&str>,
    ) -> Self {
        Self {
            content_key: content_key.into(),
            title: title.into(),
            preferred_kind: preferred_kind.map(str::to_string),
        }
    }

    /// Validate the request and turn it into a job with a fresh id.
    pub fn into_job(self) -> Result<DownloadJob, DownloadError> {
        let content_key = self.content_key.trim();
        if content_key.is_empty() {
            return Err(DownloadError::Validation("missing md5".to_string()));
        }
        // The key is embedded in the temp file name.
        if !content_key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DownloadError::Validation(
                "md5 must be alphanumeric".to_string(),
            ));
        }

        if self.title.trim().is_empty() {
            return Err(DownloadError::Validation("missing title".to_string()));
        }

        let preferred_kind = match self.preferred_kind.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(hint)
                if hint.len() <= MAX_KIND_HINT_LEN
                    && hint.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                Some(hint.to_ascii_lowercase())
            }
            Some(_) => {
                return Err(DownloadError::Validation(
                    "format must be a short alphanumeric extension".to_string(),
                ))
            }
        };

        Ok(DownloadJob {
            id: JobId::generate(),
            content_key: content_key.to_string(),
            display_name: sanitize_filename(self.title.trim()),
            preferred_kind,
            created_at: Utc::now(),
        })
    }
}

/// One accepted download attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub content_key: String,
    /// Sanitized title, safe to use as a file stem.
    pub display_name: String,
    pub preferred_kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The finalized file produced by a successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedFile {
    /// Stored name, `{display_name}.{final_extension}`.
    pub filename: String,
    /// What the classifier found in the bytes.
    pub detected_kind: ContentKind,
    /// Extension actually used.
    pub final_extension: String,
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Finished(FinishedFile),
    Cancelled,
    Failed { reason: String },
}

/// Status of a job as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Running { percent: u8 },
    Finished(FinishedFile),
    Cancelled,
    Failed { reason: String },
}

impl JobStatus {
    /// Returns true for Finished, Cancelled and Failed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running { .. })
    }
}

impl From<JobOutcome> for JobStatus {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Finished(file) => JobStatus::Finished(file),
            JobOutcome::Cancelled => JobStatus::Cancelled,
            JobOutcome::Failed { reason } => JobStatus::Failed { reason },
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    Cancelled,
    NotFound,
}

/// Point-in-time view of a running job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub content_key: String,
    pub display_name: String,
    pub percent: u8,
    pub started_at: DateTime<Utc>,
}
