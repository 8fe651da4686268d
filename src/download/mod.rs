// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background Download System for bookfetch
//!
//! This module provides non-blocking book downloads with:
//! - Progress polling by job id
//! - Cooperative cancellation between chunks
//! - Content classification and atomic promotion into the storage root
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ Job task        │
//! │                 │     │ (tokio::spawn)  │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadRegistry│◀────│ TransferExecutor│
//! │ (progress/flags)│     │ (streamed GET)  │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bookfetch::classify::MagicClassifier;
//! use bookfetch::download::{DownloadManager, DownloadRequest, TransferExecutor, TransferSettings};
//! use bookfetch::storage::Storage;
//! use bookfetch::upstream::{http_client, mirror::MirrorResolver};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = http_client("Mozilla/5.0", std::time::Duration::from_secs(30))?;
//! let manager = DownloadManager::new(
//!     Storage::open("books")?,
//!     Arc::new(MirrorResolver::new(client, "https://libgen.li")),
//!     Arc::new(MagicClassifier),
//!     TransferExecutor::new(TransferSettings::default())?,
//! );
//!
//! let id = manager.start_download(DownloadRequest::new("abc123", "My Book", Some("epub")))?;
//! println!("progress: {:?}", manager.get_progress(&id));
//! let outcome = manager.wait(&id).await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod manager;
pub mod registry;
pub mod transfer;
pub mod types;

// Re-export commonly used items
pub use error::DownloadError;
pub use manager::DownloadManager;
pub use registry::DownloadRegistry;
pub use transfer::{CancelContext, ProgressSink, TransferExecutor, TransferReport, TransferSettings};
pub use types::{
    CancelResult, DownloadJob, DownloadRequest, FinishedFile, JobId, JobOutcome, JobSnapshot,
    JobStatus,
};
