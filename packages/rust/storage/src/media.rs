//! Media phase persistence: checkpoint, queue, derived assets and status.

use dailybrief_shared::{DailyBriefError, MediaAsset, MediaStatus, Result, WorkItem};
use libsql::{Connection, params};

use crate::{ITEM_COLUMNS, Storage, now, storage_err};

/// Checkpoint name used by the media phase.
const MEDIA_CHECKPOINT: &str = "media";

/// SQL expression ranking `media_status`, mirrors [`MediaStatus::rank`].
const MEDIA_RANK_SQL: &str = "CASE media_status \
     WHEN 'not_started' THEN 0 \
     WHEN 'web_derived' THEN 1 \
     WHEN 'mobile_derived' THEN 2 \
     ELSE 3 END";

impl Storage {
    /// Highest item id whose media processing is settled, or 0.
    pub async fn media_checkpoint(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_id FROM checkpoints WHERE name = ?1",
                params![MEDIA_CHECKPOINT],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => row.get::<i64>(0).map_err(storage_err),
            None => Ok(0),
        }
    }

    /// Items after `after_id` whose media is not yet settled, ascending by id.
    pub async fn media_queue(&self, after_id: i64, limit: Option<usize>) -> Result<Vec<WorkItem>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM work_items
                 WHERE id > ?1 AND media_status NOT IN ('complete', 'skipped')
                 ORDER BY id LIMIT ?2"
            ),
            params![after_id, limit],
        )
        .await
    }

    /// Derived assets recorded for an item.
    pub async fn media_assets(&self, item_id: i64) -> Result<Vec<MediaAsset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT item_id, variant, path, width, height, bytes, quality
                 FROM media_assets WHERE item_id = ?1 ORDER BY variant DESC",
                params![item_id],
            )
            .await
            .map_err(storage_err)?;

        let mut assets = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            assets.push(MediaAsset {
                item_id: row.get::<i64>(0).map_err(storage_err)?,
                variant: row.get::<String>(1).map_err(storage_err)?.parse()?,
                path: row.get::<String>(2).map_err(storage_err)?,
                width: row.get::<u32>(3).map_err(storage_err)?,
                height: row.get::<u32>(4).map_err(storage_err)?,
                bytes: row.get::<i64>(5).map_err(storage_err)? as u64,
                quality: row.get::<u32>(6).map_err(storage_err)? as u8,
            });
        }
        Ok(assets)
    }

    /// Record a derived variant and advance the item's media status to match.
    pub async fn record_media_asset(&self, asset: &MediaAsset) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let result = async {
            tx.execute(
                "INSERT OR REPLACE INTO media_assets
                   (item_id, variant, path, width, height, bytes, quality, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    asset.item_id,
                    asset.variant.as_str(),
                    asset.path.as_str(),
                    asset.width,
                    asset.height,
                    asset.bytes as i64,
                    u32::from(asset.quality),
                    now(),
                ],
            )
            .await
            .map_err(storage_err)?;
            advance_media_status(&tx, asset.item_id, asset.variant.status(), None).await?;
            Ok::<(), DailyBriefError>(())
        }
        .await;

        match result {
            Ok(()) => tx.commit().await.map_err(storage_err),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Mark an item's media complete and move the checkpoint past it.
    pub async fn complete_media(&self, item_id: i64) -> Result<()> {
        self.settle_media(item_id, MediaStatus::Complete, None).await
    }

    /// Mark an item's media skipped (no usable image) and move the checkpoint past it.
    pub async fn skip_media(&self, item_id: i64, reason: &str) -> Result<()> {
        self.settle_media(item_id, MediaStatus::Skipped, Some(reason))
            .await
    }

    async fn settle_media(
        &self,
        item_id: i64,
        status: MediaStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let result = async {
            advance_media_status(&tx, item_id, status, reason).await?;
            tx.execute(
                "INSERT INTO checkpoints (name, last_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                   last_id = MAX(last_id, excluded.last_id),
                   updated_at = excluded.updated_at",
                params![MEDIA_CHECKPOINT, item_id, now()],
            )
            .await
            .map_err(storage_err)?;
            Ok::<(), DailyBriefError>(())
        }
        .await;

        match result {
            Ok(()) => tx.commit().await.map_err(storage_err),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

/// Move `media_status` forward to `status`. Never moves it backward.
async fn advance_media_status(
    conn: &Connection,
    item_id: i64,
    status: MediaStatus,
    reason: Option<&str>,
) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE work_items
             SET media_status = ?2, media_error = COALESCE(?4, media_error), updated_at = ?5
             WHERE id = ?1 AND ({MEDIA_RANK_SQL}) < ?3"
        ),
        params![
            item_id,
            status.as_str(),
            u32::from(status.rank()),
            reason,
            now()
        ],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}
