//! Core domain types for the DailyBrief pipeline.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{DailyBriefError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Progress of the media phase for one item. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    NotStarted,
    WebDerived,
    MobileDerived,
    Complete,
    /// Source image missing or undecodable; terminal.
    Skipped,
}

impl MediaStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::WebDerived => "web_derived",
            Self::MobileDerived => "mobile_derived",
            Self::Complete => "complete",
            Self::Skipped => "skipped",
        }
    }

    /// Position in the monotonic progression. Terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::WebDerived => 1,
            Self::MobileDerived => 2,
            Self::Complete | Self::Skipped => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }
}

impl std::str::FromStr for MediaStatus {
    type Err = DailyBriefError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "web_derived" => Ok(Self::WebDerived),
            "mobile_derived" => Ok(Self::MobileDerived),
            "complete" => Ok(Self::Complete),
            "skipped" => Ok(Self::Skipped),
            other => Err(DailyBriefError::parse(format!("unknown media status '{other}'"))),
        }
    }
}

/// Enrichment state machine for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl EnrichStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EnrichStatus {
    type Err = DailyBriefError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(DailyBriefError::parse(format!("unknown enrich status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Level / Language
// ---------------------------------------------------------------------------

/// Reading level of an enriched version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Easy,
    Mid,
    Hard,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Easy, Level::Mid, Level::Hard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Mid => "mid",
            Self::Hard => "hard",
        }
    }
}

impl std::str::FromStr for Level {
    type Err = DailyBriefError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "easy" => Ok(Self::Easy),
            "mid" => Ok(Self::Mid),
            "hard" => Ok(Self::Hard),
            other => Err(DailyBriefError::parse(format!("unknown level '{other}'"))),
        }
    }
}

/// Output language of an enriched version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    En,
    Zh,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::En, Language::Zh];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Zh => "zh",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = DailyBriefError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "en" => Ok(Self::En),
            "zh" => Ok(Self::Zh),
            other => Err(DailyBriefError::parse(format!("unknown language '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// One record returned by a feed source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEntry {
    pub title: String,
    pub body: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Preview image advertised by the feed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Insert payload for a freshly collected item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub source_key: String,
    pub feed: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
}

impl NewWorkItem {
    /// Build an insert payload from a feed entry, computing its source key.
    pub fn from_entry(feed: &str, entry: &FeedEntry) -> Result<Self> {
        Ok(Self {
            source_key: canonical_source_key(&entry.url)?,
            feed: feed.to_string(),
            title: entry.title.trim().to_string(),
            body: entry.body.clone(),
            url: entry.url.clone(),
            published_at: entry.published_at,
            image_url: entry.image_url.clone(),
        })
    }
}

/// A content item tracked through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub source_key: String,
    pub feed: String,
    pub title: String,
    pub body: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Path of the staged preview image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    pub media_status: MediaStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_error: Option<String>,
    pub enrich_status: EnrichStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Enrichment results
// ---------------------------------------------------------------------------

/// A vocabulary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub term: String,
    pub explanation: String,
}

/// A multiple-choice comprehension question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    /// The correct option; always one of `options`.
    pub answer: String,
}

/// A pro/con argument pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub pro: String,
    pub con: String,
}

/// One validated (level, language) group of an item's enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedVersion {
    pub level: Level,
    pub language: Language,
    pub summary: String,
    pub keywords: Vec<Keyword>,
    pub questions: Vec<QuizQuestion>,
    /// Present only for levels that carry context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Argument>,
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Derived image variant kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaVariant {
    Display,
    Compact,
}

impl MediaVariant {
    pub const ALL: [MediaVariant; 2] = [MediaVariant::Display, MediaVariant::Compact];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::Compact => "compact",
        }
    }

    /// Status reached once this variant is recorded.
    pub fn status(&self) -> MediaStatus {
        match self {
            Self::Display => MediaStatus::WebDerived,
            Self::Compact => MediaStatus::MobileDerived,
        }
    }
}

impl std::str::FromStr for MediaVariant {
    type Err = DailyBriefError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "display" => Ok(Self::Display),
            "compact" => Ok(Self::Compact),
            other => Err(DailyBriefError::parse(format!("unknown media variant '{other}'"))),
        }
    }
}

/// A derived image written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub item_id: i64,
    pub variant: MediaVariant,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub quality: u8,
}

// ---------------------------------------------------------------------------
// Source keys
// ---------------------------------------------------------------------------

/// Query parameters that only track the click and never identify the article.
static TRACKING_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(utm_[a-z_]+|fbclid|gclid|mc_cid|mc_eid|ref)$").expect("valid regex"));

/// Canonicalize an article URL into the natural dedup key.
///
/// Strips the fragment and tracking parameters and trims a trailing slash
/// on non-root paths. Scheme and host are lower-cased by the URL parser.
pub fn canonical_source_key(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| DailyBriefError::parse(format!("invalid item url '{raw}': {e}")))?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAM.is_match(&k.to_ascii_lowercase()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let mut key = url.to_string();
    if url.query().is_none() && key.ends_with('/') && url.path() != "/" {
        key.pop();
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn media_status_ranks_are_monotonic() {
        assert!(MediaStatus::NotStarted.rank() < MediaStatus::WebDerived.rank());
        assert!(MediaStatus::WebDerived.rank() < MediaStatus::MobileDerived.rank());
        assert!(MediaStatus::MobileDerived.rank() < MediaStatus::Complete.rank());
        assert_eq!(MediaStatus::Complete.rank(), MediaStatus::Skipped.rank());
        assert!(MediaStatus::Skipped.is_terminal());
        assert!(!MediaStatus::MobileDerived.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            EnrichStatus::Pending,
            EnrichStatus::InProgress,
            EnrichStatus::Done,
            EnrichStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EnrichStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<MediaStatus>().is_err());
    }

    #[test]
    fn level_deserializes_snake_case() {
        let level: Level = serde_json::from_str(r#""mid""#).unwrap();
        assert_eq!(level, Level::Mid);
        assert!(serde_json::from_str::<Level>(r#""expert""#).is_err());
    }

    #[test]
    fn source_key_strips_tracking_and_fragment() {
        let key =
            canonical_source_key("https://News.Example.com/world/story-1/?utm_source=rss&id=7#top")
                .unwrap();
        assert_eq!(key, "https://news.example.com/world/story-1/?id=7");

        let key = canonical_source_key("https://news.example.com/world/story-1/").unwrap();
        assert_eq!(key, "https://news.example.com/world/story-1");

        let root = canonical_source_key("https://news.example.com/").unwrap();
        assert_eq!(root, "https://news.example.com/");
    }

    #[test]
    fn source_key_distinguishes_urls() {
        let a = canonical_source_key("https://news.example.com/a").unwrap();
        let b = canonical_source_key("https://news.example.com/b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn source_key_rejects_garbage() {
        assert!(canonical_source_key("not a url").is_err());
    }
}
