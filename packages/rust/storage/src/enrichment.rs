//! Enrichment phase persistence: claims, retry accounting and the
//! decomposed per-(level, language) tables.

use dailybrief_shared::{
    Argument, DailyBriefError, EnrichStatus, EnrichedVersion, Keyword, Language, Level,
    QuizQuestion, Result, WorkItem,
};
use libsql::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::{ITEM_COLUMNS, Storage, now, storage_err};

/// Error recorded against items found `in_progress` at the start of a run.
pub const INTERRUPTED_ERROR: &str = "interrupted before completion";

/// A response body that failed validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedPayload {
    pub payload_hash: String,
    pub item_ids: Vec<i64>,
    pub reason: String,
    pub payload: String,
}

/// Tables holding one (level, language) group's rows.
const GROUP_TABLES: [&str; 5] = [
    "summaries",
    "keywords",
    "quiz_questions",
    "backgrounds",
    "arguments",
];

/// Shared retry rule: fail terminally once the ceiling is reached,
/// otherwise count the attempt and return to the queue.
const FAILURE_SET_SQL: &str = "enrich_status = CASE WHEN retry_count >= ?2 THEN 'failed' ELSE 'pending' END,
     retry_count = CASE WHEN retry_count >= ?2 THEN retry_count ELSE retry_count + 1 END";

impl Storage {
    // -----------------------------------------------------------------------
    // Queue and claims
    // -----------------------------------------------------------------------

    /// Items awaiting enrichment, ascending by id.
    pub async fn pending_items(&self, limit: Option<usize>) -> Result<Vec<WorkItem>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM work_items
                 WHERE enrich_status = 'pending' ORDER BY id LIMIT ?1"
            ),
            params![limit],
        )
        .await
    }

    /// Atomically move an item from `pending` to `in_progress`.
    ///
    /// Returns `false` if the item was not pending.
    pub async fn claim_for_enrichment(&self, item_id: i64) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE work_items SET enrich_status = 'in_progress', updated_at = ?2
                 WHERE id = ?1 AND enrich_status = 'pending'",
                params![item_id, now()],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed == 1)
    }

    /// Return a claimed item to `pending` without counting an attempt.
    pub async fn release_claim(&self, item_id: i64) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE work_items SET enrich_status = 'pending', updated_at = ?2
                 WHERE id = ?1 AND enrich_status = 'in_progress'",
                params![item_id, now()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Record a failed attempt for a claimed item.
    ///
    /// With `retry_count < ceiling` the count is incremented and the item
    /// returns to `pending`; otherwise it becomes `failed`. Returns the
    /// resulting status.
    pub async fn record_enrichment_failure(
        &self,
        item_id: i64,
        error: &str,
        ceiling: u32,
    ) -> Result<EnrichStatus> {
        self.check_writable()?;
        self.conn
            .execute(
                &format!(
                    "UPDATE work_items SET {FAILURE_SET_SQL}, last_error = ?3, updated_at = ?4
                     WHERE id = ?1 AND enrich_status = 'in_progress'"
                ),
                params![item_id, ceiling, error, now()],
            )
            .await
            .map_err(storage_err)?;

        let item = self.get_item(item_id).await?.ok_or_else(|| {
            DailyBriefError::Storage(format!("work item {item_id} not found"))
        })?;
        Ok(item.enrich_status)
    }

    /// Treat every `in_progress` item as an interrupted attempt.
    ///
    /// Returns the number of items recovered.
    pub async fn recover_stuck(&self, ceiling: u32) -> Result<u64> {
        self.check_writable()?;
        let recovered = self
            .conn
            .execute(
                &format!(
                    "UPDATE work_items SET {FAILURE_SET_SQL}, last_error = ?1, updated_at = ?3
                     WHERE enrich_status = 'in_progress'"
                ),
                params![INTERRUPTED_ERROR, ceiling, now()],
            )
            .await
            .map_err(storage_err)?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered interrupted enrichment claims");
        }
        Ok(recovered)
    }

    /// Move `failed` items back to `pending`. `retry_count` is kept.
    ///
    /// Returns the number of items reset.
    pub async fn reset_failed(&self, item_ids: &[i64]) -> Result<u64> {
        self.check_writable()?;
        let mut reset = 0;
        for id in item_ids {
            reset += self
                .conn
                .execute(
                    "UPDATE work_items SET enrich_status = 'pending', updated_at = ?2
                     WHERE id = ?1 AND enrich_status = 'failed'",
                    params![*id, now()],
                )
                .await
                .map_err(storage_err)?;
        }
        Ok(reset)
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Replace all enrichment rows for an item and mark it `done`, atomically.
    ///
    /// The item must be `in_progress`. On any error no rows are written and
    /// the status is unchanged.
    pub async fn persist_enrichment(&self, item_id: i64, versions: &[EnrichedVersion]) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let result = async {
            for table in GROUP_TABLES {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE item_id = ?1"),
                    params![item_id],
                )
                .await
                .map_err(storage_err)?;
            }
            for version in versions {
                insert_version(&tx, item_id, version).await?;
            }
            let changed = tx
                .execute(
                    "UPDATE work_items SET enrich_status = 'done', last_error = NULL, updated_at = ?2
                     WHERE id = ?1 AND enrich_status = 'in_progress'",
                    params![item_id, now()],
                )
                .await
                .map_err(storage_err)?;
            if changed != 1 {
                return Err(DailyBriefError::Storage(format!(
                    "work item {item_id} is not claimed for enrichment"
                )));
            }
            Ok(())
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

    /// Store a response body that failed validation, keyed by its hash.
    pub async fn record_rejected_payload(
        &self,
        payload_hash: &str,
        item_ids: &[i64],
        reason: &str,
        payload: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let ids = serde_json::to_string(item_ids).map_err(storage_err)?;
        self.conn
            .execute(
                "INSERT INTO rejected_payloads (payload_hash, item_ids, reason, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(payload_hash) DO NOTHING",
                params![payload_hash, ids, reason, payload, now()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Look up a rejected response body by hash.
    pub async fn get_rejected_payload(&self, payload_hash: &str) -> Result<Option<RejectedPayload>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload_hash, item_ids, reason, payload FROM rejected_payloads
                 WHERE payload_hash = ?1",
                params![payload_hash],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let ids: String = row.get(1).map_err(storage_err)?;
                Ok(Some(RejectedPayload {
                    payload_hash: row.get::<String>(0).map_err(storage_err)?,
                    item_ids: serde_json::from_str(&ids).map_err(storage_err)?,
                    reason: row.get::<String>(2).map_err(storage_err)?,
                    payload: row.get::<String>(3).map_err(storage_err)?,
                }))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Downstream reads
    // -----------------------------------------------------------------------

    /// Items whose enrichment is `done`, ascending by id.
    pub async fn list_enriched_items(&self, limit: Option<usize>) -> Result<Vec<WorkItem>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM work_items
                 WHERE enrich_status = 'done' ORDER BY id LIMIT ?1"
            ),
            params![limit],
        )
        .await
    }

    /// Reassemble one (level, language) group for an item.
    pub async fn get_enrichment(
        &self,
        item_id: i64,
        level: Level,
        language: Language,
    ) -> Result<Option<EnrichedVersion>> {
        let mut rows = self
            .conn
            .query(
                "SELECT summary FROM summaries WHERE item_id = ?1 AND level = ?2 AND language = ?3",
                params![item_id, level.as_str(), language.as_str()],
            )
            .await
            .map_err(storage_err)?;
        let summary: String = match rows.next().await.map_err(storage_err)? {
            Some(row) => row.get(0).map_err(storage_err)?,
            None => return Ok(None),
        };

        let mut keywords = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT term, explanation FROM keywords
                 WHERE item_id = ?1 AND level = ?2 AND language = ?3 ORDER BY position",
                params![item_id, level.as_str(), language.as_str()],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            keywords.push(Keyword {
                term: row.get(0).map_err(storage_err)?,
                explanation: row.get(1).map_err(storage_err)?,
            });
        }

        let mut questions = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT question, options_json, answer FROM quiz_questions
                 WHERE item_id = ?1 AND level = ?2 AND language = ?3 ORDER BY position",
                params![item_id, level.as_str(), language.as_str()],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let options: String = row.get(1).map_err(storage_err)?;
            questions.push(QuizQuestion {
                question: row.get(0).map_err(storage_err)?,
                options: serde_json::from_str(&options).map_err(storage_err)?,
                answer: row.get(2).map_err(storage_err)?,
            });
        }

        let mut rows = self
            .conn
            .query(
                "SELECT background FROM backgrounds
                 WHERE item_id = ?1 AND level = ?2 AND language = ?3",
                params![item_id, level.as_str(), language.as_str()],
            )
            .await
            .map_err(storage_err)?;
        let background = match rows.next().await.map_err(storage_err)? {
            Some(row) => Some(row.get::<String>(0).map_err(storage_err)?),
            None => None,
        };

        let mut arguments = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT pro, con FROM arguments
                 WHERE item_id = ?1 AND level = ?2 AND language = ?3 ORDER BY position",
                params![item_id, level.as_str(), language.as_str()],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            arguments.push(Argument {
                pro: row.get(0).map_err(storage_err)?,
                con: row.get(1).map_err(storage_err)?,
            });
        }

        Ok(Some(EnrichedVersion {
            level,
            language,
            summary,
            keywords,
            questions,
            background,
            arguments,
        }))
    }
}

/// Insert every row of one (level, language) group.
async fn insert_version(conn: &Connection, item_id: i64, version: &EnrichedVersion) -> Result<()> {
    let level = version.level.as_str();
    let language = version.language.as_str();

    conn.execute(
        "INSERT INTO summaries (item_id, level, language, summary) VALUES (?1, ?2, ?3, ?4)",
        params![item_id, level, language, version.summary.as_str()],
    )
    .await
    .map_err(storage_err)?;

    for (position, keyword) in version.keywords.iter().enumerate() {
        conn.execute(
            "INSERT INTO keywords (item_id, level, language, position, term, explanation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item_id,
                level,
                language,
                position as i64,
                keyword.term.as_str(),
                keyword.explanation.as_str()
            ],
        )
        .await
        .map_err(storage_err)?;
    }

    for (position, question) in version.questions.iter().enumerate() {
        let options = serde_json::to_string(&question.options).map_err(storage_err)?;
        conn.execute(
            "INSERT INTO quiz_questions (item_id, level, language, position, question, options_json, answer)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item_id,
                level,
                language,
                position as i64,
                question.question.as_str(),
                options,
                question.answer.as_str()
            ],
        )
        .await
        .map_err(storage_err)?;
    }

    if let Some(background) = &version.background {
        conn.execute(
            "INSERT INTO backgrounds (item_id, level, language, background) VALUES (?1, ?2, ?3, ?4)",
            params![item_id, level, language, background.as_str()],
        )
        .await
        .map_err(storage_err)?;
    }

    for (position, argument) in version.arguments.iter().enumerate() {
        conn.execute(
            "INSERT INTO arguments (item_id, level, language, position, pro, con)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item_id,
                level,
                language,
                position as i64,
                argument.pro.as_str(),
                argument.con.as_str()
            ],
        )
        .await
        .map_err(storage_err)?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::*;

    pub(crate) fn version(level: Level, language: Language) -> EnrichedVersion {
        EnrichedVersion {
            level,
            language,
            summary: format!("{} summary in {}", level.as_str(), language.as_str()),
            keywords: vec![Keyword {
                term: "tariff".into(),
                explanation: "a tax on imports".into(),
            }],
            questions: vec![QuizQuestion {
                question: "What was announced?".into(),
                options: vec!["A tariff".into(), "A festival".into()],
                answer: "A tariff".into(),
            }],
            background: (level == Level::Hard).then(|| "Trade talks stalled in spring.".into()),
            arguments: if level == Level::Hard {
                vec![Argument {
                    pro: "Protects industry".into(),
                    con: "Raises prices".into(),
                }]
            } else {
                Vec::new()
            },
        }
    }

    async fn claimed_item(storage: &Storage, url: &str) -> i64 {
        let id = storage.insert_item(&new_item(url, "A")).await.unwrap().id();
        assert!(storage.claim_for_enrichment(id).await.unwrap());
        id
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let storage = test_storage().await;
        let id = claimed_item(&storage, "https://news.example.com/a").await;
        assert!(!storage.claim_for_enrichment(id).await.unwrap());
        assert!(storage.pending_items(None).await.unwrap().is_empty());

        storage.release_claim(id).await.unwrap();
        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.enrich_status, EnrichStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn failures_count_until_ceiling() {
        let storage = test_storage().await;
        let id = claimed_item(&storage, "https://news.example.com/a").await;

        for attempt in 1..=2 {
            let status = storage
                .record_enrichment_failure(id, "timeout", 2)
                .await
                .unwrap();
            assert_eq!(status, EnrichStatus::Pending);
            let item = storage.get_item(id).await.unwrap().unwrap();
            assert_eq!(item.retry_count, attempt);
            assert!(storage.claim_for_enrichment(id).await.unwrap());
        }

        let status = storage
            .record_enrichment_failure(id, "timeout again", 2)
            .await
            .unwrap();
        assert_eq!(status, EnrichStatus::Failed);
        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 2);
        assert_eq!(item.last_error.as_deref(), Some("timeout again"));
        assert!(!storage.claim_for_enrichment(id).await.unwrap());
    }

    #[tokio::test]
    async fn zero_ceiling_fails_on_first_error() {
        let storage = test_storage().await;
        let id = claimed_item(&storage, "https://news.example.com/a").await;
        let status = storage
            .record_enrichment_failure(id, "bad output", 0)
            .await
            .unwrap();
        assert_eq!(status, EnrichStatus::Failed);
        assert_eq!(storage.get_item(id).await.unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn recover_stuck_counts_an_attempt() {
        let storage = test_storage().await;
        let id = claimed_item(&storage, "https://news.example.com/a").await;

        let recovered = storage.recover_stuck(3).await.unwrap();
        assert_eq!(recovered, 1);
        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.enrich_status, EnrichStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.last_error.as_deref(), Some(INTERRUPTED_ERROR));
    }

    #[tokio::test]
    async fn reset_failed_keeps_retry_count() {
        let storage = test_storage().await;
        let id = claimed_item(&storage, "https://news.example.com/a").await;
        storage
            .record_enrichment_failure(id, "bad", 0)
            .await
            .unwrap();

        assert_eq!(storage.reset_failed(&[id, 999]).await.unwrap(), 1);
        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.enrich_status, EnrichStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn persist_and_read_back() {
        let storage = test_storage().await;
        let id = claimed_item(&storage, "https://news.example.com/a").await;
        let versions = vec![
            version(Level::Easy, Language::En),
            version(Level::Hard, Language::Zh),
        ];
        storage.persist_enrichment(id, &versions).await.unwrap();

        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.enrich_status, EnrichStatus::Done);
        assert!(item.last_error.is_none());

        let easy = storage
            .get_enrichment(id, Level::Easy, Language::En)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(easy, versions[0]);
        let hard = storage
            .get_enrichment(id, Level::Hard, Language::Zh)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hard, versions[1]);
        assert!(
            storage
                .get_enrichment(id, Level::Mid, Language::En)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(storage.list_enriched_items(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persist_requires_claim() {
        let storage = test_storage().await;
        let id = storage
            .insert_item(&new_item("https://news.example.com/a", "A"))
            .await
            .unwrap()
            .id();
        let result = storage
            .persist_enrichment(id, &[version(Level::Easy, Language::En)])
            .await;
        assert!(result.is_err());
        assert!(
            storage
                .get_enrichment(id, Level::Easy, Language::En)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn persist_is_all_or_nothing() {
        let storage = test_storage().await;
        let id = claimed_item(&storage, "https://news.example.com/a").await;
        exec(
            &storage,
            "CREATE TRIGGER fail_quiz BEFORE INSERT ON quiz_questions
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .await;

        let result = storage
            .persist_enrichment(id, &[version(Level::Easy, Language::En)])
            .await;
        assert!(result.is_err());

        let counts = storage.group_row_counts().await.unwrap();
        assert!(counts.is_empty());
        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.enrich_status, EnrichStatus::InProgress);
    }

    #[tokio::test]
    async fn persist_replaces_previous_rows() {
        let storage = test_storage().await;
        let id = claimed_item(&storage, "https://news.example.com/a").await;
        storage
            .persist_enrichment(id, &[version(Level::Hard, Language::En)])
            .await
            .unwrap();

        // Simulate a manual re-run of the same item.
        exec(
            &storage,
            &format!("UPDATE work_items SET enrich_status = 'in_progress' WHERE id = {id}"),
        )
        .await;
        storage
            .persist_enrichment(id, &[version(Level::Hard, Language::En)])
            .await
            .unwrap();

        let counts = storage.group_row_counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].keywords, 1);
        assert_eq!(counts[0].context, 2);
    }

    #[tokio::test]
    async fn rejected_payload_stored_once() {
        let storage = test_storage().await;
        storage
            .record_rejected_payload("abc123", &[1, 2], "missing items", "{}")
            .await
            .unwrap();
        storage
            .record_rejected_payload("abc123", &[1, 2], "missing items", "{}")
            .await
            .unwrap();
        let stored = storage.get_rejected_payload("abc123").await.unwrap().unwrap();
        assert_eq!(stored.item_ids, vec![1, 2]);
        assert_eq!(stored.reason, "missing items");
    }
}
