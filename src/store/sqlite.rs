//! SQLite-backed implementation of the persistence store.
//!
//! Uses a shared `sqlx` pool with the schema bootstrapped on connect
//! (idempotent `CREATE TABLE IF NOT EXISTS`). Ordinates are persisted twice:
//! the raw string for readback and a fixed-width sort key so SQL `ORDER BY`
//! agrees with [`Ordinate`]'s total order.

use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::model::{
    BlockRef, CheckpointLocation, CheckpointRecord, EvalOutput, Evaluation, ModuleFormat,
    ModuleMeta, ModuleOptions, Process, Tag,
};
use crate::ordinate::{Ordinate, SortOrder};

use super::{EvaluationQuery, MessageBeforeQuery, Result, SaveOutcome, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processes (
    id          TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    signature   TEXT NOT NULL,
    module_id   TEXT NOT NULL,
    block_height    INTEGER NOT NULL,
    block_timestamp INTEGER NOT NULL,
    tags_json   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS modules (
    id          TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    format      TEXT NOT NULL,
    options_json TEXT NOT NULL,
    tags_json   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS evaluations (
    process_id  TEXT NOT NULL,
    ordinate    TEXT NOT NULL,
    sort_key    TEXT NOT NULL,
    cron        TEXT NOT NULL DEFAULT '',
    timestamp   INTEGER NOT NULL,
    block_height INTEGER NOT NULL,
    message_id  TEXT,
    deep_hash   TEXT,
    epoch       INTEGER,
    nonce       INTEGER,
    output_json TEXT NOT NULL,
    gas_used    INTEGER NOT NULL,
    PRIMARY KEY (process_id, sort_key, cron, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_evaluations_range
    ON evaluations (process_id, sort_key);
CREATE INDEX IF NOT EXISTS idx_evaluations_message
    ON evaluations (process_id, message_id);
CREATE INDEX IF NOT EXISTS idx_evaluations_deep_hash
    ON evaluations (process_id, deep_hash);
CREATE TABLE IF NOT EXISTS blocks (
    height      INTEGER PRIMARY KEY,
    timestamp   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS checkpoint_records (
    process_id  TEXT NOT NULL,
    sort_key    TEXT NOT NULL,
    ordinate    TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    block_height INTEGER NOT NULL,
    module_id   TEXT NOT NULL,
    epoch       INTEGER,
    nonce       INTEGER,
    location_kind TEXT NOT NULL,
    location    TEXT NOT NULL,
    PRIMARY KEY (process_id, sort_key)
);
"#;

/// The embedded persistence store.
///
/// Single-writer by construction (the orchestrator); concurrent reads are
/// handled by the engine. Cloning shares the pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

impl SqliteStore {
    /// Connect (or create) the database at `db_url`.
    ///
    /// Accepts a bare path or a `sqlite://` URL. The backing file and its
    /// parent directories are created when missing, then the schema is
    /// bootstrapped.
    #[instrument(skip(db_url))]
    pub async fn connect(db_url: &str) -> Result<Self> {
        let path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
        if path != ":memory:" && !path.is_empty() {
            let p = std::path::Path::new(path);
            if let Some(parent) = p.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if !p.exists() {
                let _ = std::fs::File::create_new(p);
            }
        }
        let pool = SqlitePool::connect(&format!("sqlite://{path}")).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /* ---------- processes ---------- */

    #[instrument(skip(self), err)]
    pub async fn find_process(&self, id: &str) -> Result<Option<Process>> {
        let row = sqlx::query("SELECT * FROM processes WHERE id = ?1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        row.map(row_to_process).transpose()
    }

    /// Upsert tolerating reinsert of an identical row.
    #[instrument(skip(self, process), err)]
    pub async fn save_process(&self, process: &Process) -> Result<SaveOutcome> {
        let tags_json = to_json(&process.tags, "process tags")?;
        let done = sqlx::query(
            r#"
            INSERT OR IGNORE INTO processes
                (id, owner, signature, module_id, block_height, block_timestamp, tags_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        )
        .bind(&process.id)
        .bind(&process.owner)
        .bind(&process.signature)
        .bind(&process.module_id)
        .bind(process.block.height as i64)
        .bind(process.block.timestamp)
        .bind(&tags_json)
        .execute(&*self.pool)
        .await?;
        Ok(outcome(done.rows_affected()))
    }

    /* ---------- modules ---------- */

    #[instrument(skip(self), err)]
    pub async fn find_module(&self, id: &str) -> Result<Option<ModuleMeta>> {
        let row = sqlx::query("SELECT * FROM modules WHERE id = ?1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        row.map(row_to_module).transpose()
    }

    #[instrument(skip(self, module), err)]
    pub async fn save_module(&self, module: &ModuleMeta) -> Result<SaveOutcome> {
        let options_json = to_json(&module.options, "module options")?;
        let tags_json = to_json(&module.tags, "module tags")?;
        let done = sqlx::query(
            r#"
            INSERT OR IGNORE INTO modules (id, owner, format, options_json, tags_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        )
        .bind(&module.id)
        .bind(&module.owner)
        .bind(module.format.as_str())
        .bind(&options_json)
        .bind(&tags_json)
        .execute(&*self.pool)
        .await?;
        Ok(outcome(done.rows_affected()))
    }

    /* ---------- evaluations ---------- */

    #[instrument(skip(self, ordinate), err)]
    pub async fn find_evaluation(
        &self,
        process_id: &str,
        ordinate: &Ordinate,
        cron: Option<&str>,
    ) -> Result<Option<Evaluation>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM evaluations
            WHERE process_id = ?1 AND sort_key = ?2 AND cron = ?3
            ORDER BY timestamp DESC
            LIMIT 1
        "#,
        )
        .bind(process_id)
        .bind(ordinate.sort_key())
        .bind(cron.unwrap_or(""))
        .fetch_optional(&*self.pool)
        .await?;
        row.map(row_to_evaluation).transpose()
    }

    /// Append-only insert; a second save of the same key is a no-op.
    #[instrument(skip(self, eval), fields(process_id = %eval.process_id, ordinate = %eval.ordinate), err)]
    pub async fn save_evaluation(&self, eval: &Evaluation) -> Result<SaveOutcome> {
        let output_json = to_json(&eval.output, "evaluation output")?;
        let done = sqlx::query(
            r#"
            INSERT OR IGNORE INTO evaluations
                (process_id, ordinate, sort_key, cron, timestamp, block_height,
                 message_id, deep_hash, epoch, nonce, output_json, gas_used)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        )
        .bind(&eval.process_id)
        .bind(eval.ordinate.as_str())
        .bind(eval.ordinate.sort_key())
        .bind(eval.cron.as_deref().unwrap_or(""))
        .bind(eval.timestamp)
        .bind(eval.block_height as i64)
        .bind(&eval.message_id)
        .bind(&eval.deep_hash)
        .bind(eval.epoch.map(|e| e as i64))
        .bind(eval.nonce.map(|n| n as i64))
        .bind(&output_json)
        .bind(eval.gas_used as i64)
        .execute(&*self.pool)
        .await?;
        Ok(outcome(done.rows_affected()))
    }

    /// Ordered range query; `from` exclusive, `to` inclusive.
    #[instrument(skip(self, query), err)]
    pub async fn find_evaluations(
        &self,
        process_id: &str,
        query: &EvaluationQuery,
    ) -> Result<Vec<Evaluation>> {
        let mut conditions = vec!["process_id = ?1".to_string()];
        let mut param = 1;
        if query.from.is_some() {
            param += 1;
            conditions.push(format!("sort_key > ?{param}"));
        }
        if query.to.is_some() {
            param += 1;
            conditions.push(format!("sort_key <= ?{param}"));
        }
        if query.only_cron {
            conditions.push("cron != ''".to_string());
        }
        let where_clause = conditions.join(" AND ");
        let dir = query.sort.as_sql();
        let limit = query.limit.unwrap_or(1000).min(1000);
        let sql = format!(
            "SELECT * FROM evaluations WHERE {where_clause} \
             ORDER BY sort_key {dir}, timestamp {dir} LIMIT {limit}"
        );

        let mut q = sqlx::query(&sql).bind(process_id);
        if let Some(from) = &query.from {
            q = q.bind(from.sort_key());
        }
        if let Some(to) = &query.to {
            q = q.bind(to.sort_key());
        }
        let rows = q.fetch_all(&*self.pool).await?;
        rows.into_iter().map(row_to_evaluation).collect()
    }

    /// Latest prior evaluation of a message with the same identity, used to
    /// short-circuit re-cranking duplicates.
    #[instrument(skip(self, query), fields(process_id = %query.process_id), err)]
    pub async fn find_message_before(
        &self,
        query: &MessageBeforeQuery,
    ) -> Result<Option<Evaluation>> {
        // Identity is deep_hash when present, else message_id. Assigned
        // messages match epoch+nonce too so re-assignment is not a dup.
        let row = match (&query.deep_hash, &query.message_id) {
            (Some(deep_hash), _) => {
                sqlx::query(
                    r#"
                    SELECT * FROM evaluations
                    WHERE process_id = ?1 AND deep_hash = ?2
                    ORDER BY sort_key DESC
                    LIMIT 1
                "#,
                )
                .bind(&query.process_id)
                .bind(deep_hash)
                .fetch_optional(&*self.pool)
                .await?
            }
            (None, Some(message_id)) if query.is_assignment => {
                sqlx::query(
                    r#"
                    SELECT * FROM evaluations
                    WHERE process_id = ?1 AND message_id = ?2
                      AND ((?3 IS NULL AND epoch IS NULL) OR epoch = ?3)
                      AND ((?4 IS NULL AND nonce IS NULL) OR nonce = ?4)
                    ORDER BY sort_key DESC
                    LIMIT 1
                "#,
                )
                .bind(&query.process_id)
                .bind(message_id)
                .bind(query.epoch.map(|e| e as i64))
                .bind(query.nonce.map(|n| n as i64))
                .fetch_optional(&*self.pool)
                .await?
            }
            (None, Some(message_id)) => {
                sqlx::query(
                    r#"
                    SELECT * FROM evaluations
                    WHERE process_id = ?1 AND message_id = ?2
                    ORDER BY sort_key DESC
                    LIMIT 1
                "#,
                )
                .bind(&query.process_id)
                .bind(message_id)
                .fetch_optional(&*self.pool)
                .await?
            }
            (None, None) => None,
        };
        row.map(row_to_evaluation).transpose()
    }

    /* ---------- blocks ---------- */

    /// Inclusive height range, ascending.
    #[instrument(skip(self), err)]
    pub async fn find_blocks(&self, min_height: u64, max_height: u64) -> Result<Vec<BlockRef>> {
        let rows = sqlx::query(
            "SELECT height, timestamp FROM blocks WHERE height >= ?1 AND height <= ?2 ORDER BY height ASC",
        )
        .bind(min_height as i64)
        .bind(max_height as i64)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| BlockRef {
                height: r.get::<i64, _>("height") as u64,
                timestamp: r.get("timestamp"),
            })
            .collect())
    }

    #[instrument(skip(self, blocks), err)]
    pub async fn save_blocks(&self, blocks: &[BlockRef]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for block in blocks {
            sqlx::query("INSERT OR IGNORE INTO blocks (height, timestamp) VALUES (?1, ?2)")
                .bind(block.height as i64)
                .bind(block.timestamp)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /* ---------- checkpoint records ---------- */

    #[instrument(skip(self, record), fields(process_id = %record.process_id), err)]
    pub async fn write_checkpoint_record(&self, record: &CheckpointRecord) -> Result<SaveOutcome> {
        let (kind, location) = match &record.location {
            CheckpointLocation::File(name) => ("file", name.as_str()),
            CheckpointLocation::Tx(id) => ("tx", id.as_str()),
        };
        let done = sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoint_records
                (process_id, sort_key, ordinate, timestamp, block_height,
                 module_id, epoch, nonce, location_kind, location)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        )
        .bind(&record.process_id)
        .bind(record.ordinate.sort_key())
        .bind(record.ordinate.as_str())
        .bind(record.timestamp)
        .bind(record.block_height as i64)
        .bind(&record.module_id)
        .bind(record.epoch.map(|e| e as i64))
        .bind(record.nonce.map(|n| n as i64))
        .bind(kind)
        .bind(location)
        .execute(&*self.pool)
        .await?;
        Ok(outcome(done.rows_affected()))
    }

    /// Greatest record at or before the target ordinate.
    #[instrument(skip(self, before), err)]
    pub async fn find_checkpoint_record_before(
        &self,
        process_id: &str,
        before: &Ordinate,
    ) -> Result<Option<CheckpointRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM checkpoint_records
            WHERE process_id = ?1 AND sort_key <= ?2
            ORDER BY sort_key DESC
            LIMIT 1
        "#,
        )
        .bind(process_id)
        .bind(before.sort_key())
        .fetch_optional(&*self.pool)
        .await?;
        row.map(row_to_checkpoint_record).transpose()
    }
}

/* ---------- row mapping ---------- */

fn outcome(rows_affected: u64) -> SaveOutcome {
    if rows_affected > 0 {
        SaveOutcome::Inserted
    } else {
        SaveOutcome::AlreadyPresent
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &'static str) -> Result<String> {
    serde_json::to_string(value).map_err(|source| StoreError::Corrupt { what, source })
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, what: &'static str) -> Result<T> {
    serde_json::from_str(raw).map_err(|source| StoreError::Corrupt { what, source })
}

fn row_to_process(row: SqliteRow) -> Result<Process> {
    let tags: Vec<Tag> = from_json(&row.get::<String, _>("tags_json"), "process tags")?;
    Ok(Process {
        id: row.get("id"),
        owner: row.get("owner"),
        signature: row.get("signature"),
        module_id: row.get("module_id"),
        block: BlockRef {
            height: row.get::<i64, _>("block_height") as u64,
            timestamp: row.get("block_timestamp"),
        },
        tags,
    })
}

fn row_to_module(row: SqliteRow) -> Result<ModuleMeta> {
    let options: ModuleOptions = from_json(&row.get::<String, _>("options_json"), "module options")?;
    let tags: Vec<Tag> = from_json(&row.get::<String, _>("tags_json"), "module tags")?;
    Ok(ModuleMeta {
        id: row.get("id"),
        owner: row.get("owner"),
        format: ModuleFormat(row.get("format")),
        options,
        tags,
    })
}

fn row_to_evaluation(row: SqliteRow) -> Result<Evaluation> {
    let output: EvalOutput = from_json(&row.get::<String, _>("output_json"), "evaluation output")?;
    let cron: String = row.get("cron");
    Ok(Evaluation {
        process_id: row.get("process_id"),
        ordinate: Ordinate::new(row.get::<String, _>("ordinate")),
        cron: (!cron.is_empty()).then_some(cron),
        timestamp: row.get("timestamp"),
        block_height: row.get::<i64, _>("block_height") as u64,
        message_id: row.get("message_id"),
        deep_hash: row.get("deep_hash"),
        epoch: row.get::<Option<i64>, _>("epoch").map(|e| e as u64),
        nonce: row.get::<Option<i64>, _>("nonce").map(|n| n as u64),
        output,
        gas_used: row.get::<i64, _>("gas_used") as u64,
    })
}

fn row_to_checkpoint_record(row: SqliteRow) -> Result<CheckpointRecord> {
    let kind: String = row.get("location_kind");
    let location: String = row.get("location");
    Ok(CheckpointRecord {
        process_id: row.get("process_id"),
        module_id: row.get("module_id"),
        ordinate: Ordinate::new(row.get::<String, _>("ordinate")),
        timestamp: row.get("timestamp"),
        block_height: row.get::<i64, _>("block_height") as u64,
        epoch: row.get::<Option<i64>, _>("epoch").map(|e| e as u64),
        nonce: row.get::<Option<i64>, _>("nonce").map(|n| n as u64),
        location: if kind == "tx" {
            CheckpointLocation::Tx(location)
        } else {
            CheckpointLocation::File(location)
        },
    })
}
