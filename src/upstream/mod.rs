// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Upstream collaborators: the book index and the download mirror.
//!
//! Both are HTML scrapers behind small traits so the download manager and the
//! HTTP layer can be exercised with in-process fakes.

pub mod mirror;
pub mod search;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use mirror::{parse_mirror_page, MirrorResolver};
pub use search::{parse_search_page, ArchiveSearch};

/// Resolves a content key to a concrete file URL.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Returns `Ok(None)` when the mirror has no link for the key.
    async fn resolve(&self, content_key: &str) -> Result<Option<String>>;
}

/// Searches the book index.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage>;
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub author: Option<String>,
    pub url: String,
    pub md5: Option<String>,
    pub format: Option<String>,
}

/// Paging information for a result page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub has_previous: bool,
    pub has_next: bool,
}

/// A page of search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub results: Vec<SearchResult>,
    pub pagination: Pagination,
}

/// Build the HTTP client used for upstream page requests.
pub fn http_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
        .context("Failed to build upstream HTTP client")
}
