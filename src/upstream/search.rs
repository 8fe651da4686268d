// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Book index search scraper.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use super::{Pagination, SearchPage, SearchProvider, SearchResult};

static RESULT_BLOCK: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"div[class~="h-[110px]"], div.flex.flex-col"#).expect("result block selector")
});
static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h3").expect("title selector"));
static AUTHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.italic").expect("author selector"));
static LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("link selector"));
static FORMAT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"span.hidden[class~="md:inline"]"#).expect("format selector")
});

/// Scraper for the archive's `/search` page.
#[derive(Debug, Clone)]
pub struct ArchiveSearch {
    client: reqwest::Client,
    base_url: String,
}

impl ArchiveSearch {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SearchProvider for ArchiveSearch {
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage> {
        let page = page.max(1);
        let mut url = Url::parse(&self.base_url)
            .and_then(|base| base.join("/search"))
            .with_context(|| format!("Invalid search base URL {}", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("page", &page.to_string());

        tracing::debug!(query = %query, page, "Searching book index");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Search request failed")?;
        if !response.status().is_success() {
            bail!("Search page answered HTTP {}", response.status());
        }
        let html = response.text().await.context("Failed to read search page")?;

        Ok(parse_search_page(&html, &self.base_url, page))
    }
}

/// Extract result records and paging from a search page.
///
/// Blocks without a title or a link are skipped. Nested layout blocks can
/// match twice, so results are de-duplicated by URL.
pub fn parse_search_page(html: &str, base_url: &str, page: u32) -> SearchPage {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    let mut seen = HashSet::new();
    let mut results = Vec::new();
    for block in document.select(&RESULT_BLOCK) {
        let Some(record) = parse_block(block, base.as_ref()) else {
            continue;
        };
        if seen.insert(record.url.clone()) {
            results.push(record);
        }
    }

    let next_marker = format!("page={}", page.saturating_add(1));
    let has_next = document
        .select(&LINK)
        .filter_map(|a| a.value().attr("href"))
        .any(|href| href.contains(&next_marker));

    SearchPage {
        results,
        pagination: Pagination {
            page,
            has_previous: page > 1,
            has_next,
        },
    }
}

fn parse_block(block: ElementRef<'_>, base: Option<&Url>) -> Option<SearchResult> {
    let title = text_of(block.select(&TITLE).next()?);
    if title.is_empty() {
        return None;
    }
    let href = block.select(&LINK).next()?.value().attr("href")?;

    let url = match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    };
    let md5 = href
        .split_once("/md5/")
        .and_then(|(_, rest)| rest.split(|c: char| matches!(c, '/' | '?' | '#')).next())
        .filter(|hash| !hash.is_empty())
        .map(str::to_string);
    let author = block
        .select(&AUTHOR)
        .next()
        .map(text_of)
        .filter(|a| !a.is_empty());
    let format = block
        .select(&FORMAT)
        .next()
        .map(|span| text_of(span).to_lowercase())
        .filter(|f| !f.is_empty());

    Some(SearchResult {
        title,
        author,
        url,
        md5,
        format,
    })
}

fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://archive.example";

    const PAGE: &str = r#"
        <html><body>
          <div class="h-[110px] flex">
            <a href="/md5/0123abcd/extra"><h3> Dune </h3></a>
            <div class="italic">Frank Herbert</div>
            <span class="hidden md:inline">EPUB</span>
          </div>
          <div class="flex flex-col">
            <a href="/md5/ffee99"><h3>Neuromancer</h3></a>
            <div class="italic">William Gibson</div>
          </div>
          <div class="flex flex-col"><p>no title here</p></div>
          <a href="/search?q=dune&page=3">next</a>
        </body></html>
    "#;

    #[test]
    fn test_parse_records() {
        let page = parse_search_page(PAGE, BASE, 2);
        assert_eq!(page.results.len(), 2);

        let dune = &page.results[0];
        assert_eq!(dune.title, "Dune");
        assert_eq!(dune.author.as_deref(), Some("Frank Herbert"));
        assert_eq!(dune.url, "https://archive.example/md5/0123abcd/extra");
        assert_eq!(dune.md5.as_deref(), Some("0123abcd"));
        assert_eq!(dune.format.as_deref(), Some("epub"));

        let neuromancer = &page.results[1];
        assert_eq!(neuromancer.md5.as_deref(), Some("ffee99"));
        assert_eq!(neuromancer.format, None);
    }

    #[test]
    fn test_parse_pagination() {
        let page = parse_search_page(PAGE, BASE, 2);
        assert_eq!(
            page.pagination,
            Pagination {
                page: 2,
                has_previous: true,
                has_next: true
            }
        );

        let first = parse_search_page(PAGE, BASE, 1);
        assert!(!first.pagination.has_previous);
        assert!(!first.pagination.has_next);
    }

    #[test]
    fn test_parse_pagination_at_max_page() {
        let html = r#"<a href="/search?q=dune&page=0">wrapped</a>"#;
        let page = parse_search_page(html, BASE, u32::MAX);
        assert_eq!(page.pagination.page, u32::MAX);
        assert!(page.pagination.has_previous);
        assert!(!page.pagination.has_next);
    }

    #[test]
    fn test_link_without_md5() {
        let html = r#"<div class="flex flex-col"><a href="/isbn/123"><h3>X</h3></a></div>"#;
        let page = parse_search_page(html, BASE, 1);
        assert_eq!(page.results[0].md5, None);
    }

    #[test]
    fn test_empty_page() {
        let page = parse_search_page("<html></html>", BASE, 1);
        assert!(page.results.is_empty());
    }
}
