//! Preview image staging for freshly inserted items.
//!
//! The image comes from the feed entry when it advertises one, otherwise
//! from the article page's `og:image` meta tag. Bytes are written as-is to
//! the staging directory; decoding is the media phase's job.

use std::path::{Path, PathBuf};

use dailybrief_shared::{DailyBriefError, Result};
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

/// Downloads preview images into a staging directory.
pub struct PreviewStager {
    client: Client,
    staging_dir: PathBuf,
    max_bytes: usize,
}

impl PreviewStager {
    pub fn new(client: Client, staging_dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            client,
            staging_dir: staging_dir.into(),
            max_bytes,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Stage the preview image for `item_id`.
    ///
    /// Returns `Ok(None)` when neither the feed nor the article page names an image.
    pub async fn stage(
        &self,
        item_id: i64,
        image_url: Option<&str>,
        article_url: &str,
    ) -> Result<Option<PathBuf>> {
        let image_url = match image_url {
            Some(url) => url.to_string(),
            None => match self.scrape_og_image(article_url).await? {
                Some(url) => url,
                None => {
                    debug!(item_id, "no preview image advertised");
                    return Ok(None);
                }
            },
        };

        let bytes = self.download(&image_url).await?;

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| DailyBriefError::io(&self.staging_dir, e))?;
        let path = self.staging_dir.join(format!("item-{item_id}.src"));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| DailyBriefError::io(&path, e))?;

        debug!(item_id, %image_url, bytes = bytes.len(), "staged preview image");
        Ok(Some(path))
    }

    async fn scrape_og_image(&self, article_url: &str) -> Result<Option<String>> {
        let base = Url::parse(article_url)
            .map_err(|e| DailyBriefError::parse(format!("invalid article url '{article_url}': {e}")))?;
        let response = self
            .client
            .get(base.as_str())
            .send()
            .await
            .map_err(|e| DailyBriefError::Network(format!("{article_url}: {e}")))?;
        if !response.status().is_success() {
            return Err(DailyBriefError::Network(format!(
                "{article_url}: HTTP {}",
                response.status()
            )));
        }
        let html = response.text().await.map_err(|e| {
            DailyBriefError::Network(format!("{article_url}: failed to read body: {e}"))
        })?;
        Ok(find_og_image(&html, &base))
    }

    async fn download(&self, image_url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(image_url)
            .send()
            .await
            .map_err(|e| DailyBriefError::Network(format!("{image_url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DailyBriefError::Network(format!("{image_url}: HTTP {status}")));
        }
        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(DailyBriefError::validation(format!(
                    "{image_url}: image too large ({len} bytes, max {})",
                    self.max_bytes
                )));
            }
        }

        let bytes = response.bytes().await.map_err(|e| {
            DailyBriefError::Network(format!("{image_url}: failed to read body: {e}"))
        })?;
        if bytes.len() > self.max_bytes {
            return Err(DailyBriefError::validation(format!(
                "{image_url}: image too large ({} bytes, max {})",
                bytes.len(),
                self.max_bytes
            )));
        }
        Ok(bytes.to_vec())
    }
}

/// Extract the `og:image` URL from an article page, resolved against `base`.
pub fn find_og_image(html: &str, base: &Url) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse(
        r#"meta[property="og:image"], meta[property="og:image:url"], meta[name="twitter:image"]"#,
    )
    .ok()?;

    doc.select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .and_then(|c| base.join(c).ok())
        .map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn og_image_absolute_and_relative() {
        let base = Url::parse("https://news.example.com/world/story").unwrap();
        let html = r#"<html><head>
            <meta property="og:title" content="Story">
            <meta property="og:image" content="/img/lead.jpg">
        </head><body></body></html>"#;
        assert_eq!(
            find_og_image(html, &base).as_deref(),
            Some("https://news.example.com/img/lead.jpg")
        );

        let html = r#"<meta name="twitter:image" content="https://cdn.example.com/x.png">"#;
        assert_eq!(
            find_og_image(html, &base).as_deref(),
            Some("https://cdn.example.com/x.png")
        );
    }

    #[test]
    fn og_image_missing() {
        let base = Url::parse("https://news.example.com/").unwrap();
        assert!(find_og_image("<html><head></head></html>", &base).is_none());
        assert!(find_og_image(r#"<meta property="og:image" content="  ">"#, &base).is_none());
    }
}
