//! SQL migration definitions for the DailyBrief database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: work_items, checkpoints, media_assets, run_summaries",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per collected article. AUTOINCREMENT keeps ids from ever being reused.
CREATE TABLE IF NOT EXISTS work_items (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    source_key    TEXT NOT NULL UNIQUE,
    feed          TEXT NOT NULL,
    title         TEXT NOT NULL,
    body          TEXT NOT NULL,
    url           TEXT NOT NULL,
    published_at  TEXT,
    image_url     TEXT,
    source_image  TEXT,
    media_status  TEXT NOT NULL DEFAULT 'not_started',
    media_error   TEXT,
    enrich_status TEXT NOT NULL DEFAULT 'pending',
    retry_count   INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    last_error    TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_enrich ON work_items(enrich_status, id);
CREATE INDEX IF NOT EXISTS idx_work_items_media ON work_items(media_status, id);

-- Collected content never changes after insertion.
CREATE TRIGGER IF NOT EXISTS work_items_raw_immutable
BEFORE UPDATE OF source_key, feed, title, body, url, published_at, image_url ON work_items
BEGIN
    SELECT RAISE(ABORT, 'work item content is immutable');
END;

CREATE TRIGGER IF NOT EXISTS work_items_retry_monotonic
BEFORE UPDATE OF retry_count ON work_items
WHEN new.retry_count < old.retry_count
BEGIN
    SELECT RAISE(ABORT, 'retry_count may not decrease');
END;

-- Named resume points, advanced as watermarks.
CREATE TABLE IF NOT EXISTS checkpoints (
    name       TEXT PRIMARY KEY,
    last_id    INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

-- Derived image variants.
CREATE TABLE IF NOT EXISTS media_assets (
    item_id    INTEGER NOT NULL REFERENCES work_items(id),
    variant    TEXT NOT NULL,
    path       TEXT NOT NULL,
    width      INTEGER NOT NULL,
    height     INTEGER NOT NULL,
    bytes      INTEGER NOT NULL,
    quality    INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (item_id, variant)
);

-- One row per orchestrator invocation.
CREATE TABLE IF NOT EXISTS run_summaries (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    finished_at  TEXT NOT NULL,
    dry_run      INTEGER NOT NULL,
    fatal_error  TEXT,
    summary_json TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Decomposed enrichment tables and rejected payloads",
            sql: r#"
CREATE TABLE IF NOT EXISTS summaries (
    item_id  INTEGER NOT NULL REFERENCES work_items(id),
    level    TEXT NOT NULL,
    language TEXT NOT NULL,
    summary  TEXT NOT NULL,
    PRIMARY KEY (item_id, level, language)
);

CREATE TABLE IF NOT EXISTS keywords (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id     INTEGER NOT NULL REFERENCES work_items(id),
    level       TEXT NOT NULL,
    language    TEXT NOT NULL,
    position    INTEGER NOT NULL,
    term        TEXT NOT NULL,
    explanation TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_keywords_group ON keywords(item_id, level, language);

CREATE TABLE IF NOT EXISTS quiz_questions (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id      INTEGER NOT NULL REFERENCES work_items(id),
    level        TEXT NOT NULL,
    language     TEXT NOT NULL,
    position     INTEGER NOT NULL,
    question     TEXT NOT NULL,
    options_json TEXT NOT NULL,
    answer       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_quiz_questions_group ON quiz_questions(item_id, level, language);

CREATE TABLE IF NOT EXISTS backgrounds (
    item_id    INTEGER NOT NULL REFERENCES work_items(id),
    level      TEXT NOT NULL,
    language   TEXT NOT NULL,
    background TEXT NOT NULL,
    PRIMARY KEY (item_id, level, language)
);

CREATE TABLE IF NOT EXISTS arguments (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id  INTEGER NOT NULL REFERENCES work_items(id),
    level    TEXT NOT NULL,
    language TEXT NOT NULL,
    position INTEGER NOT NULL,
    pro      TEXT NOT NULL,
    con      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_arguments_group ON arguments(item_id, level, language);

-- Responses that failed validation, referenced from logs by hash.
CREATE TABLE IF NOT EXISTS rejected_payloads (
    payload_hash TEXT PRIMARY KEY,
    item_ids     TEXT NOT NULL,
    reason       TEXT NOT NULL,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
