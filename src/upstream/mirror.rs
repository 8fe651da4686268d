// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Mirror link resolution: content key -> direct file URL.

use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};

use super::LinkResolver;

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

/// Marker of the direct download script in mirror links.
const DOWNLOAD_SCRIPT: &str = "get.php";

/// Resolves keys through the mirror's `ads.php` landing page.
#[derive(Debug, Clone)]
pub struct MirrorResolver {
    client: reqwest::Client,
    base_url: String,
}

impl MirrorResolver {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LinkResolver for MirrorResolver {
    async fn resolve(&self, content_key: &str) -> Result<Option<String>> {
        let mut url = Url::parse(&self.base_url)
            .and_then(|base| base.join("/ads.php"))
            .with_context(|| format!("Invalid mirror base URL {}", self.base_url))?;
        url.query_pairs_mut().append_pair("md5", content_key);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Mirror request failed")?;
        if !response.status().is_success() {
            bail!("Mirror page answered HTTP {}", response.status());
        }
        let html = response.text().await.context("Failed to read mirror page")?;

        Ok(parse_mirror_page(&html, &self.base_url))
    }
}

/// Find the first direct download link on a mirror landing page.
pub fn parse_mirror_page(html: &str, base_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let href = document
        .select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| href.contains(DOWNLOAD_SCRIPT))?;

    let base = Url::parse(base_url).ok()?;
    base.join(href).ok().map(|url| url.to_string())
}
