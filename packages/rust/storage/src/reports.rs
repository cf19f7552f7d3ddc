//! Aggregate reads used by the verifier and the run summary.

use dailybrief_shared::{Language, Level, Result};
use libsql::params;
use serde::{Deserialize, Serialize};

use crate::{Storage, storage_err};

/// Item counts per stage status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub total_items: u64,
    pub media_complete: u64,
    pub media_skipped: u64,
    /// Items whose media is not yet settled.
    pub media_pending: u64,
    pub enrich_pending: u64,
    pub enrich_in_progress: u64,
    pub enrich_done: u64,
    pub enrich_failed: u64,
}

/// Row counts for one item's (level, language) group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRowCount {
    pub item_id: i64,
    pub level: Level,
    pub language: Language,
    pub summaries: u64,
    pub keywords: u64,
    pub questions: u64,
    /// Background plus argument rows.
    pub context: u64,
}

/// An item that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: i64,
    pub title: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Storage {
    /// Count items in each media and enrichment state.
    pub async fn stage_counts(&self) -> Result<StageCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT
                   COUNT(*),
                   COALESCE(SUM(media_status = 'complete'), 0),
                   COALESCE(SUM(media_status = 'skipped'), 0),
                   COALESCE(SUM(media_status NOT IN ('complete', 'skipped')), 0),
                   COALESCE(SUM(enrich_status = 'pending'), 0),
                   COALESCE(SUM(enrich_status = 'in_progress'), 0),
                   COALESCE(SUM(enrich_status = 'done'), 0),
                   COALESCE(SUM(enrich_status = 'failed'), 0)
                 FROM work_items",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(StageCounts::default());
        };
        let count = |i: i32| -> Result<u64> { Ok(row.get::<i64>(i).map_err(storage_err)? as u64) };
        Ok(StageCounts {
            total_items: count(0)?,
            media_complete: count(1)?,
            media_skipped: count(2)?,
            media_pending: count(3)?,
            enrich_pending: count(4)?,
            enrich_in_progress: count(5)?,
            enrich_done: count(6)?,
            enrich_failed: count(7)?,
        })
    }

    /// Per-group row counts across every enrichment table.
    ///
    /// Only groups with at least one row are returned.
    pub async fn group_row_counts(&self) -> Result<Vec<GroupRowCount>> {
        let mut rows = self
            .conn
            .query(
                "SELECT item_id, level, language,
                        SUM(kind = 's'), SUM(kind = 'k'), SUM(kind = 'q'), SUM(kind = 'c')
                 FROM (
                   SELECT item_id, level, language, 's' AS kind FROM summaries
                   UNION ALL SELECT item_id, level, language, 'k' FROM keywords
                   UNION ALL SELECT item_id, level, language, 'q' FROM quiz_questions
                   UNION ALL SELECT item_id, level, language, 'c' FROM backgrounds
                   UNION ALL SELECT item_id, level, language, 'c' FROM arguments
                 )
                 GROUP BY item_id, level, language
                 ORDER BY item_id, level, language",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            counts.push(GroupRowCount {
                item_id: row.get::<i64>(0).map_err(storage_err)?,
                level: row.get::<String>(1).map_err(storage_err)?.parse()?,
                language: row.get::<String>(2).map_err(storage_err)?.parse()?,
                summaries: row.get::<i64>(3).map_err(storage_err)? as u64,
                keywords: row.get::<i64>(4).map_err(storage_err)? as u64,
                questions: row.get::<i64>(5).map_err(storage_err)? as u64,
                context: row.get::<i64>(6).map_err(storage_err)? as u64,
            });
        }
        Ok(counts)
    }

    /// Items in the terminal `failed` state, ascending by id.
    pub async fn failed_items(&self) -> Result<Vec<FailedItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, retry_count, last_error FROM work_items
                 WHERE enrich_status = 'failed' ORDER BY id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            items.push(FailedItem {
                id: row.get::<i64>(0).map_err(storage_err)?,
                title: row.get::<String>(1).map_err(storage_err)?,
                retry_count: row.get::<i64>(2).map_err(storage_err)? as u32,
                last_error: row.get::<String>(3).ok(),
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::tests::version;
    use crate::test_support::*;

    #[tokio::test]
    async fn empty_store_counts_zero() {
        let storage = test_storage().await;
        assert_eq!(storage.stage_counts().await.unwrap(), StageCounts::default());
        assert!(storage.group_row_counts().await.unwrap().is_empty());
        assert!(storage.failed_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stage_counts_track_statuses() {
        let storage = test_storage().await;
        let a = storage
            .insert_item(&new_item("https://news.example.com/a", "A"))
            .await
            .unwrap()
            .id();
        let b = storage
            .insert_item(&new_item("https://news.example.com/b", "B"))
            .await
            .unwrap()
            .id();
        storage
            .insert_item(&new_item("https://news.example.com/c", "C"))
            .await
            .unwrap();

        storage.complete_media(a).await.unwrap();
        storage.skip_media(b, "no image").await.unwrap();
        assert!(storage.claim_for_enrichment(a).await.unwrap());
        storage
            .persist_enrichment(a, &[version(Level::Easy, Language::En)])
            .await
            .unwrap();
        assert!(storage.claim_for_enrichment(b).await.unwrap());
        storage
            .record_enrichment_failure(b, "invalid json", 0)
            .await
            .unwrap();

        let counts = storage.stage_counts().await.unwrap();
        assert_eq!(
            counts,
            StageCounts {
                total_items: 3,
                media_complete: 1,
                media_skipped: 1,
                media_pending: 1,
                enrich_pending: 1,
                enrich_in_progress: 0,
                enrich_done: 1,
                enrich_failed: 1,
            }
        );

        let failed = storage.failed_items().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, b);
        assert_eq!(failed[0].last_error.as_deref(), Some("invalid json"));
    }

    #[tokio::test]
    async fn group_counts_per_table() {
        let storage = test_storage().await;
        let id = storage
            .insert_item(&new_item("https://news.example.com/a", "A"))
            .await
            .unwrap()
            .id();
        assert!(storage.claim_for_enrichment(id).await.unwrap());
        storage
            .persist_enrichment(
                id,
                &[version(Level::Easy, Language::En), version(Level::Hard, Language::En)],
            )
            .await
            .unwrap();

        let counts = storage.group_row_counts().await.unwrap();
        assert_eq!(counts.len(), 2);
        let easy = counts.iter().find(|c| c.level == Level::Easy).unwrap();
        assert_eq!((easy.summaries, easy.keywords, easy.questions, easy.context), (1, 1, 1, 0));
        let hard = counts.iter().find(|c| c.level == Level::Hard).unwrap();
        assert_eq!(hard.context, 2);
    }
}
