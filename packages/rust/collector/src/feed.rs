//! Feed sources: the seam between the collector and the outside world.
//!
//! [`HttpFeedSource`] reads JSON Feed 1.x documents
//! (<https://www.jsonfeed.org/version/1.1/>).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dailybrief_shared::{DailyBriefError, FeedConfig, FeedEntry, Result};
use reqwest::Client;
use scraper::Html;
use serde::Deserialize;
use tracing::debug;

use crate::USER_AGENT;

/// Maximum feed document size we accept (5 MB).
const MAX_FEED_SIZE: u64 = 5 * 1024 * 1024;

/// Something that yields the latest entries of a configured feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch at most `limit` entries, newest first as published by the feed.
    async fn fetch(&self, feed: &FeedConfig, limit: usize) -> Result<Vec<FeedEntry>>;
}

// ---------------------------------------------------------------------------
// JSON Feed over HTTP
// ---------------------------------------------------------------------------

/// Fetches JSON Feed documents over HTTP.
pub struct HttpFeedSource {
    client: Client,
}

impl HttpFeedSource {
    /// Create a source whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| DailyBriefError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, feed: &FeedConfig, limit: usize) -> Result<Vec<FeedEntry>> {
        let response = self
            .client
            .get(&feed.url)
            .send()
            .await
            .map_err(|e| DailyBriefError::Network(format!("{}: {e}", feed.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DailyBriefError::Network(format!(
                "{}: HTTP {status}",
                feed.url
            )));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_FEED_SIZE {
                return Err(DailyBriefError::validation(format!(
                    "{}: feed too large ({len} bytes, max {MAX_FEED_SIZE})",
                    feed.url
                )));
            }
        }

        let body = response.text().await.map_err(|e| {
            DailyBriefError::Network(format!("{}: failed to read body: {e}", feed.url))
        })?;

        parse_json_feed(&body, limit)
    }
}

#[derive(Debug, Deserialize)]
struct JsonFeed {
    #[serde(default)]
    items: Vec<JsonFeedItem>,
}

#[derive(Debug, Deserialize)]
struct JsonFeedItem {
    title: Option<String>,
    content_text: Option<String>,
    content_html: Option<String>,
    summary: Option<String>,
    url: Option<String>,
    external_url: Option<String>,
    date_published: Option<String>,
    image: Option<String>,
    banner_image: Option<String>,
}

/// Parse a JSON Feed document into at most `limit` entries.
///
/// Items without a title or URL cannot become work items and are dropped.
pub fn parse_json_feed(body: &str, limit: usize) -> Result<Vec<FeedEntry>> {
    let feed: JsonFeed = serde_json::from_str(body)
        .map_err(|e| DailyBriefError::parse(format!("invalid JSON feed: {e}")))?;

    let mut entries = Vec::new();
    for item in feed.items {
        if entries.len() >= limit {
            break;
        }

        let url = item.url.or(item.external_url);
        let title = item.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        let (Some(url), Some(title)) = (url, title) else {
            debug!("skipping feed item without title or url");
            continue;
        };

        let body = match (item.content_text, item.content_html, item.summary) {
            (Some(text), _, _) => text,
            (None, Some(html), _) => html_to_text(&html),
            (None, None, Some(summary)) => summary,
            (None, None, None) => String::new(),
        };

        let published_at = item
            .date_published
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc));

        entries.push(FeedEntry {
            title,
            body,
            url,
            published_at,
            image_url: item.image.or(item.banner_image),
        });
    }

    Ok(entries)
}

/// Flatten an HTML fragment to whitespace-normalized text.
fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_items_and_respects_limit() {
        let body = r#"{
            "version": "https://jsonfeed.org/version/1.1",
            "title": "World",
            "items": [
                {"id": "1", "title": "First", "url": "https://n.example.com/1",
                 "content_text": "Body one", "date_published": "2026-03-01T08:00:00Z",
                 "image": "https://n.example.com/1.jpg"},
                {"id": "2", "title": "Second", "url": "https://n.example.com/2",
                 "content_html": "<p>Body <b>two</b></p>"},
                {"id": "3", "title": "Third", "url": "https://n.example.com/3"}
            ]
        }"#;

        let entries = parse_json_feed(body, 2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "First");
        assert_eq!(entries[0].body, "Body one");
        assert!(entries[0].published_at.is_some());
        assert_eq!(entries[0].image_url.as_deref(), Some("https://n.example.com/1.jpg"));
        assert_eq!(entries[1].body, "Body two");
        assert!(entries[1].image_url.is_none());
    }

    #[test]
    fn skips_items_without_url_or_title() {
        let body = r#"{"items": [
            {"title": "No link"},
            {"url": "https://n.example.com/untitled", "title": "   "},
            {"title": "Linked", "external_url": "https://n.example.com/x"}
        ]}"#;
        let entries = parse_json_feed(body, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://n.example.com/x");
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_json_feed("<rss></rss>", 5).is_err());
    }

    #[test]
    fn html_is_flattened() {
        assert_eq!(
            html_to_text("<div>Hello,\n  <em>world</em></div>"),
            "Hello, world"
        );
    }
}
