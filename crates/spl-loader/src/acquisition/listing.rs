//! Archive listing scraper
//!
//! The listing page groups downloads as `<ul class="download"><li>...</li></ul>`;
//! each item carries an HTTPS link to a `.zip` and an "MD5 checksum: <hex>" note.

use regex::Regex;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use super::with_retry;
use crate::config::HttpConfig;
use crate::error::{EtlError, Result};
use crate::models::{clean_string, Archive};

/// Parse the listing HTML.
///
/// Relative links are resolved against `base_url`. Items without an HTTPS
/// `.zip` link or without a checksum are ignored; a page with no usable items
/// yields an empty list.
pub fn parse_archive_list(html: &str, base_url: &str) -> Result<Vec<Archive>> {
    let item_selector = Selector::parse("ul.download > li")
        .map_err(|e| EtlError::config(format!("invalid listing selector: {}", e)))?;
    let link_selector = Selector::parse("a")
        .map_err(|e| EtlError::config(format!("invalid link selector: {}", e)))?;
    let checksum_pattern = Regex::new(r"MD5 checksum:\s*([0-9a-fA-F]{32})")
        .map_err(|e| EtlError::config(format!("invalid checksum pattern: {}", e)))?;
    let base = Url::parse(base_url).ok();

    let document = Html::parse_document(html);
    let mut archives = Vec::new();

    for item in document.select(&item_selector) {
        let Some(link) = item
            .select(&link_selector)
            .find(|a| a.text().collect::<String>().contains("HTTPS"))
        else {
            continue;
        };

        let Some(href) = link.value().attr("href").map(str::trim) else {
            continue;
        };
        if !href.ends_with(".zip") {
            continue;
        }

        let text = item.text().collect::<Vec<_>>().join(" ");
        let Some(checksum) = checksum_pattern
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        else {
            debug!("No checksum next to {}, skipping", href);
            continue;
        };

        let url = match &base {
            Some(base) => base
                .join(href)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        };
        let Some(name) = clean_string(href.rsplit('/').next()) else {
            continue;
        };

        archives.push(Archive {
            name,
            url,
            checksum,
        });
    }

    Ok(archives)
}

/// Fetches and parses the listing page
pub struct ArchiveListing {
    client: Client,
    http: HttpConfig,
    source_url: String,
}

impl ArchiveListing {
    pub fn new(client: Client, http: HttpConfig, source_url: impl Into<String>) -> Self {
        Self {
            client,
            http,
            source_url: source_url.into(),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Every archive currently published, retrying transient failures.
    pub async fn fetch(&self) -> Result<Vec<Archive>> {
        info!("Fetching archive list from {}", self.source_url);

        let html = with_retry(&self.http, "Archive listing", || self.fetch_page()).await?;
        let archives = parse_archive_list(&html, &self.source_url)?;

        if archives.is_empty() {
            warn!(
                "Could not find any archives on {}. The page structure may have changed.",
                self.source_url
            );
        } else {
            info!("Found {} archive(s) on the listing page", archives.len());
        }

        Ok(archives)
    }

    async fn fetch_page(&self) -> Result<String> {
        let response = self.client.get(&self.source_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EtlError::HttpStatus {
                status: status.as_u16(),
                url: self.source_url.clone(),
            });
        }
        Ok(response.text().await?)
    }
}
