// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the download pipeline.

/// Errors raised while accepting, running or finalizing a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /// Missing or malformed request fields.
    Validation(String),
    /// Unknown job id or missing stored file.
    NotFound(String),
    /// The upstream mirror did not yield a download link.
    Resolution(String),
    /// Network failure or unusable response during the transfer.
    Transfer(String),
    /// Filesystem failure while writing, promoting or deleting a file.
    Storage(String),
    /// A freshly generated job id collided with a live one.
    DuplicateJob(String),
}

impl DownloadError {
    /// Reason recorded in a failed job's completion slot.
    pub fn reason(&self) -> &str {
        match self {
            Self::Validation(msg)
            | Self::NotFound(msg)
            | Self::Resolution(msg)
            | Self::Transfer(msg)
            | Self::Storage(msg)
            | Self::DuplicateJob(msg) => msg,
        }
    }
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "Invalid request: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Resolution(msg) => write!(f, "Resolution failed: {}", msg),
            Self::Transfer(msg) => write!(f, "Transfer failed: {}", msg),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
            Self::DuplicateJob(id) => write!(f, "Job id already registered: {}", id),
        }
    }
}

impl std::error::Error for DownloadError {}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownloadError::Transfer("request timed out".to_string())
        } else if e.is_connect() {
            DownloadError::Transfer(format!("cannot connect to mirror: {}", e))
        } else {
            DownloadError::Transfer(e.to_string())
        }
    }
}
