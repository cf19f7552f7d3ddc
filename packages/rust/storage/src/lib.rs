//! libSQL-backed WorkItemStore for the DailyBrief pipeline.
//!
//! The [`Storage`] struct wraps a libSQL database holding work items and
//! their per-stage status, the media checkpoint, derived media assets, the
//! decomposed enrichment tables, rejected payloads and run summaries.
//! It is the only state shared between pipeline phases.
//!
//! **Access rules:**
//! - Pipeline phases: read-write via [`Storage::open`]
//! - Website / email generation: read-only via [`Storage::open_readonly`]

mod enrichment;
mod media;
mod migrations;
mod reports;

use std::path::Path;

use chrono::{DateTime, Utc};
use dailybrief_shared::{DailyBriefError, NewWorkItem, Result, WorkItem};
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize};

pub use enrichment::{INTERRUPTED_ERROR, RejectedPayload};
pub use reports::{FailedItem, GroupRowCount, StageCounts};

/// Column list matching [`row_to_work_item`].
const ITEM_COLUMNS: &str = "id, source_key, feed, title, body, url, published_at, image_url, \
     source_image, media_status, media_error, enrich_status, retry_count, last_error, created_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Result of offering a collected item to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was created with this id.
    Inserted(i64),
    /// An item with the same source key already exists under this id.
    Duplicate(i64),
}

impl InsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) => *id,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Persisted record of one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRunSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub fatal_error: Option<String>,
    /// Full summary document (phase counts, failed items).
    pub summary_json: String,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DailyBriefError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for display and email consumers).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DailyBriefError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DailyBriefError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DailyBriefError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Work item operations
    // -----------------------------------------------------------------------

    /// Insert a collected item unless one with the same source key exists.
    ///
    /// Existing items are never updated.
    pub async fn insert_item(&self, item: &NewWorkItem) -> Result<InsertOutcome> {
        self.check_writable()?;
        let now = now();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO work_items
                   (source_key, feed, title, body, url, published_at, image_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(source_key) DO NOTHING",
                params![
                    item.source_key.as_str(),
                    item.feed.as_str(),
                    item.title.as_str(),
                    item.body.as_str(),
                    item.url.as_str(),
                    item.published_at.map(|t| t.to_rfc3339()),
                    item.image_url.as_deref(),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;

        if inserted == 1 {
            return Ok(InsertOutcome::Inserted(self.conn.last_insert_rowid()));
        }

        let existing = self.find_by_source_key(&item.source_key).await?.ok_or_else(|| {
            DailyBriefError::Storage(format!(
                "insert of '{}' was ignored but no existing row was found",
                item.source_key
            ))
        })?;
        Ok(InsertOutcome::Duplicate(existing.id))
    }

    /// Look up an item by its natural key.
    pub async fn find_by_source_key(&self, source_key: &str) -> Result<Option<WorkItem>> {
        self.query_one_item(
            &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE source_key = ?1"),
            params![source_key],
        )
        .await
    }

    /// Get an item by id.
    pub async fn get_item(&self, id: i64) -> Result<Option<WorkItem>> {
        self.query_one_item(
            &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
            params![id],
        )
        .await
    }

    /// List every item in ascending id order.
    pub async fn list_items(&self) -> Result<Vec<WorkItem>> {
        self.query_items(
            &format!("SELECT {ITEM_COLUMNS} FROM work_items ORDER BY id"),
            params![],
        )
        .await
    }

    /// Record where the preview image for an item was staged.
    pub async fn set_source_image(&self, id: i64, path: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE work_items SET source_image = ?1, updated_at = ?2 WHERE id = ?3",
                params![path, now(), id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn query_one_item(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<WorkItem>> {
        let mut rows = self.conn.query(sql, params).await.map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_work_item(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_items(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<WorkItem>> {
        let mut rows = self.conn.query(sql, params).await.map_err(storage_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_work_item(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Run summaries
    // -----------------------------------------------------------------------

    /// Persist the summary of one orchestrator run.
    pub async fn insert_run_summary(&self, summary: &StoredRunSummary) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO run_summaries (id, started_at, finished_at, dry_run, fatal_error, summary_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    summary.id.as_str(),
                    summary.started_at.to_rfc3339(),
                    summary.finished_at.to_rfc3339(),
                    i64::from(summary.dry_run),
                    summary.fatal_error.as_deref(),
                    summary.summary_json.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent run summary, if any run has been recorded.
    pub async fn latest_run_summary(&self) -> Result<Option<StoredRunSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, dry_run, fatal_error, summary_json
                 FROM run_summaries ORDER BY started_at DESC, id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(StoredRunSummary {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: parse_timestamp(&row.get::<String>(1).map_err(storage_err)?)?,
                finished_at: parse_timestamp(&row.get::<String>(2).map_err(storage_err)?)?,
                dry_run: row.get::<i64>(3).map_err(storage_err)? != 0,
                fatal_error: row.get::<String>(4).ok(),
                summary_json: row.get::<String>(5).map_err(storage_err)?,
            })),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map any libSQL failure into the storage error variant.
pub(crate) fn storage_err(e: impl std::fmt::Display) -> DailyBriefError {
    DailyBriefError::Storage(e.to_string())
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DailyBriefError::Storage(format!("invalid date '{s}': {e}")))
}

/// Convert a database row to a [`WorkItem`].
fn row_to_work_item(row: &libsql::Row) -> Result<WorkItem> {
    Ok(WorkItem {
        id: row.get::<i64>(0).map_err(storage_err)?,
        source_key: row.get::<String>(1).map_err(storage_err)?,
        feed: row.get::<String>(2).map_err(storage_err)?,
        title: row.get::<String>(3).map_err(storage_err)?,
        body: row.get::<String>(4).map_err(storage_err)?,
        url: row.get::<String>(5).map_err(storage_err)?,
        published_at: row
            .get::<String>(6)
            .ok()
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        image_url: row.get::<String>(7).ok(),
        source_image: row.get::<String>(8).ok(),
        media_status: row.get::<String>(9).map_err(storage_err)?.parse()?,
        media_error: row.get::<String>(10).ok(),
        enrich_status: row.get::<String>(11).map_err(storage_err)?.parse()?,
        retry_count: row.get::<i64>(12).map_err(storage_err)? as u32,
        last_error: row.get::<String>(13).ok(),
        created_at: parse_timestamp(&row.get::<String>(14).map_err(storage_err)?)?,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use dailybrief_shared::{EnrichStatus, MediaStatus};
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("db_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn insert_new_item_defaults() {
        let storage = test_storage().await;
        let outcome = storage
            .insert_item(&new_item("https://news.example.com/a", "A"))
            .await
            .expect("insert");
        assert!(outcome.is_inserted());

        let item = storage.get_item(outcome.id()).await.unwrap().unwrap();
        assert_eq!(item.title, "A");
        assert_eq!(item.source_key, "https://news.example.com/a");
        assert_eq!(item.media_status, MediaStatus::NotStarted);
        assert_eq!(item.enrich_status, EnrichStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert!(item.last_error.is_none());
    }

    #[tokio::test]
    async fn duplicate_source_key_is_not_updated() {
        let storage = test_storage().await;
        let first = storage
            .insert_item(&new_item("https://news.example.com/a", "Original"))
            .await
            .unwrap();
        let second = storage
            .insert_item(&new_item("https://news.example.com/a#comments", "Changed"))
            .await
            .unwrap();

        assert_eq!(second, InsertOutcome::Duplicate(first.id()));
        let item = storage.get_item(first.id()).await.unwrap().unwrap();
        assert_eq!(item.title, "Original");
        assert_eq!(storage.list_items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_title_different_url_both_kept() {
        let storage = test_storage().await;
        let a = storage
            .insert_item(&new_item("https://news.example.com/a", "Same headline"))
            .await
            .unwrap();
        let b = storage
            .insert_item(&new_item("https://news.example.com/b", "Same headline"))
            .await
            .unwrap();
        assert!(a.is_inserted() && b.is_inserted());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn raw_content_is_immutable() {
        let storage = test_storage().await;
        let id = storage
            .insert_item(&new_item("https://news.example.com/a", "A"))
            .await
            .unwrap()
            .id();
        let result = storage
            .conn
            .execute(
                "UPDATE work_items SET title = 'tampered' WHERE id = ?1",
                params![id],
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn source_image_recorded() {
        let storage = test_storage().await;
        let id = storage
            .insert_item(&new_item("https://news.example.com/a", "A"))
            .await
            .unwrap()
            .id();
        storage.set_source_image(id, "/tmp/a.img").await.unwrap();
        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.source_image.as_deref(), Some("/tmp/a.img"));
    }

    #[tokio::test]
    async fn run_summary_roundtrip() {
        let storage = test_storage().await;
        assert!(storage.latest_run_summary().await.unwrap().is_none());

        let summary = StoredRunSummary {
            id: Uuid::now_v7().to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: true,
            fatal_error: Some("store unreachable".into()),
            summary_json: r#"{"phases":[]}"#.into(),
        };
        storage.insert_run_summary(&summary).await.unwrap();

        let latest = storage.latest_run_summary().await.unwrap().unwrap();
        assert_eq!(latest.id, summary.id);
        assert!(latest.dry_run);
        assert_eq!(latest.fatal_error.as_deref(), Some("store unreachable"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("db_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_item(&new_item("https://news.example.com/a", "A"))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_items().await.unwrap().len(), 1);
        let result = ro
            .insert_item(&new_item("https://news.example.com/b", "B"))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_database() {
        let tmp = std::env::temp_dir().join(format!("db_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
