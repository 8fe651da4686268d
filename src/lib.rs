// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! bookfetch - Book search and background download server
//!
//! Search a third-party book index, download a located file in the
//! background, poll its progress, cancel it mid-transfer, then fetch or
//! delete the stored file.
//!
//! **Search** -> **Resolve mirror link** -> **Stream to temp file** -> **Classify** -> **Promote**
//!
//! # Core Modules
//!
//! - [`download`] - Job registry, transfer executor and download manager
//! - [`classify`] - Magic-byte detection of ebook formats
//! - [`storage`] - Flat storage root with traversal-safe lookups
//! - [`upstream`] - Search index and mirror page scraping
//! - [`server`] - HTTP API
//! - [`errors`] - User-facing error responses
//! - [`config`] - Persistent configuration

pub mod classify;
pub mod config;
pub mod download;
pub mod errors;
pub mod security;
pub mod server;
pub mod storage;
pub mod upstream;

// Re-export the download core
pub use download::{
    CancelResult, DownloadError, DownloadManager, DownloadRegistry, DownloadRequest, JobId,
    JobOutcome, JobStatus,
};

pub use classify::{ContentClassifier, ContentKind, MagicClassifier};
pub use config::{load_config, save_config, Config};
pub use server::Server;
pub use storage::Storage;
pub use upstream::{LinkResolver, SearchPage, SearchProvider, SearchResult};

// Re-export error handling
pub use errors::{generate_reference_code, sanitize_error_details, ApiResult, ErrorResponse, UserError};
