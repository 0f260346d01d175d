//! SQLite persistence gateway: cached prepared statements, immediate-mode
//! transactions and WAL maintenance over a single owned connection.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Duration;

use mf_core::{merge_patch_str, OutputRow, ProviderTag, SourceRow};
use sqlx::query::{Query, QueryAs};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
    SqliteStatement, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, Executor, FromRow, Sqlite, Statement};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Initial table layout. `raw` holds minified JSON text.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id TEXT NOT NULL,
    provider TEXT NOT NULL,
    raw TEXT NOT NULL CHECK (json_valid(raw)),
    PRIMARY KEY (id, provider)
);

CREATE TABLE IF NOT EXISTS outputs (
    id TEXT NOT NULL,
    input_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    raw TEXT NOT NULL CHECK (json_valid(raw)),
    PRIMARY KEY (id, input_id, provider),
    FOREIGN KEY (input_id, provider) REFERENCES sources (id, provider) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_outputs_provider ON outputs (provider);
"#;

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("creating database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("nested transactions are not supported")]
    NestedTransaction,
    #[error("stored payload for {key} is not valid JSON: {source}")]
    Payload {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<&String> for SqlParam {
    fn from(value: &String) -> Self {
        SqlParam::Text(value.clone())
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Integer(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

impl From<ProviderTag> for SqlParam {
    fn from(value: ProviderTag) -> Self {
        SqlParam::Text(value.as_str().to_string())
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlParam::Null)
    }
}

fn bind_query<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &SqlParam,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Integer(v) => query.bind(*v),
        SqlParam::Real(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.clone()),
    }
}

fn bind_query_as<'q, O>(
    query: QueryAs<'q, Sqlite, O, SqliteArguments<'q>>,
    param: &SqlParam,
) -> QueryAs<'q, Sqlite, O, SqliteArguments<'q>> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Integer(v) => query.bind(*v),
        SqlParam::Real(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.clone()),
    }
}

/// What an upsert did to the output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
    /// The patch matched the stored payload; nothing was written.
    Unchanged,
}

/// Owned handle on the embedded store. One per process run; not shared.
pub struct Database {
    conn: SqliteConnection,
    statements: HashMap<String, SqliteStatement<'static>>,
    in_transaction: bool,
    /// A transaction guard was dropped unfinished; roll back before the next statement.
    abandoned: bool,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("cached_statements", &self.statements.len())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl Database {
    /// Open (creating if needed) the store at `path` with WAL, busy timeout,
    /// foreign keys and relaxed `synchronous`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal);

        let mut conn = options.connect().await?;
        (&mut conn)
            .execute("PRAGMA temp_store = memory; PRAGMA optimize = 0x10002;")
            .await?;

        debug!(path = %path.display(), "database opened");
        Ok(Self {
            conn,
            statements: HashMap::new(),
            in_transaction: false,
            abandoned: false,
        })
    }

    /// Create the tables if they do not exist yet.
    pub async fn migrate(&mut self) -> Result<(), StorageError> {
        self.settle().await;
        (&mut self.conn).execute(SCHEMA).await?;
        Ok(())
    }

    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    async fn ensure_prepared(
        conn: &mut SqliteConnection,
        statements: &mut HashMap<String, SqliteStatement<'static>>,
        sql: &str,
    ) -> Result<(), StorageError> {
        if statements.contains_key(sql) {
            return Ok(());
        }
        let prepared = (&mut *conn).prepare(sql).await?;
        let prepared = Statement::to_owned(&prepared);
        statements.insert(sql.to_string(), prepared);
        Ok(())
    }

    /// Run a parameterized statement and decode every returned row.
    ///
    /// The statement is prepared once per distinct query text; if running it
    /// fails, it is dropped from the cache before the error is returned.
    pub async fn execute<T>(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<T>, StorageError>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        self.settle().await;
        let sql = sql.trim();
        let Self {
            conn, statements, ..
        } = self;
        Self::ensure_prepared(conn, statements, sql).await?;

        let outcome = match statements.get(sql) {
            Some(statement) => {
                let query = params
                    .iter()
                    .fold(statement.query_as::<T>(), bind_query_as);
                query.fetch_all(&mut *conn).await
            }
            None => sqlx::query_as::<_, T>(sql).fetch_all(&mut *conn).await,
        };

        outcome.map_err(|err| {
            statements.remove(sql);
            StorageError::from(err)
        })
    }

    /// Run a parameterized statement that returns no rows; yields the affected row count.
    pub async fn run(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, StorageError> {
        self.settle().await;
        let sql = sql.trim();
        let Self {
            conn, statements, ..
        } = self;
        Self::ensure_prepared(conn, statements, sql).await?;

        let outcome = match statements.get(sql) {
            Some(statement) => {
                let query = params.iter().fold(statement.query(), bind_query);
                query.execute(&mut *conn).await
            }
            None => sqlx::query(sql).execute(&mut *conn).await,
        };

        match outcome {
            Ok(done) => Ok(done.rows_affected()),
            Err(err) => {
                statements.remove(sql);
                Err(err.into())
            }
        }
    }

    /// Start a `BEGIN IMMEDIATE` transaction.
    ///
    /// Statements run through the returned guard until [`Transaction::commit`].
    /// A guard dropped without commit is rolled back before the next statement.
    /// Beginning again while a guard is open returns [`StorageError::NestedTransaction`].
    pub async fn begin(&mut self) -> Result<Transaction<'_>, StorageError> {
        if self.in_transaction {
            return Err(StorageError::NestedTransaction);
        }
        self.settle().await;
        (&mut self.conn).execute("BEGIN IMMEDIATE").await?;
        self.in_transaction = true;
        Ok(Transaction {
            db: self,
            finished: false,
        })
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn settle(&mut self) {
        if std::mem::take(&mut self.abandoned) {
            self.rollback().await;
        }
    }

    async fn rollback(&mut self) {
        if let Err(err) = (&mut self.conn).execute("ROLLBACK").await {
            warn!(error = %err, "rollback failed");
        }
    }

    /// `PRAGMA wal_checkpoint(TRUNCATE)`; bounds WAL growth after a run.
    pub async fn checkpoint(&mut self) -> Result<(), StorageError> {
        self.settle().await;
        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
                .fetch_one(&mut self.conn)
                .await?;
        debug!(busy, log_frames, checkpointed, "wal checkpoint");
        Ok(())
    }

    /// Final optimize pass, then release the statement cache and the connection.
    pub async fn close(mut self) -> Result<(), StorageError> {
        self.settle().await;
        (&mut self.conn).execute("PRAGMA optimize").await?;
        self.statements.clear();
        self.conn.close().await?;
        Ok(())
    }

    pub async fn sources_for(&mut self, provider: ProviderTag) -> Result<Vec<SourceRow>, StorageError> {
        self.execute(
            "select id, provider, raw from sources where provider = ? order by rowid",
            &[provider.into()],
        )
        .await
    }

    /// Insert a source, overwriting the payload of an existing `(id, provider)`.
    pub async fn upsert_source(&mut self, row: &SourceRow) -> Result<(), StorageError> {
        self.run(
            "insert into sources (id, provider, raw) values (?, ?, json(?))
             on conflict (id, provider) do update set raw = excluded.raw",
            &[(&row.id).into(), row.provider.into(), (&row.raw).into()],
        )
        .await?;
        info!(source = %row.key(), "source stored");
        Ok(())
    }

    /// Overwrite the stored payload of an existing source. Returns false when no row matched.
    pub async fn update_source_raw(&mut self, row: &SourceRow) -> Result<bool, StorageError> {
        let affected = self
            .run(
                "update sources set raw = json(?) where id = ? and provider = ?",
                &[(&row.raw).into(), (&row.id).into(), row.provider.into()],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn output(
        &mut self,
        id: &str,
        input_id: &str,
        provider: ProviderTag,
    ) -> Result<Option<OutputRow>, StorageError> {
        let mut rows: Vec<OutputRow> = self
            .execute(
                "select id, input_id, provider, raw from outputs
                 where id = ? and input_id = ? and provider = ?",
                &[id.into(), input_id.into(), provider.into()],
            )
            .await?;
        Ok(rows.pop())
    }

    /// Outputs of one provider, newest first by the JSON field at `order_path`.
    pub async fn outputs_for(
        &mut self,
        provider: ProviderTag,
        order_path: &str,
        limit: u32,
        page: u32,
    ) -> Result<Vec<OutputRow>, StorageError> {
        let offset = i64::from(page) * i64::from(limit);
        self.execute(
            "select id, input_id, provider, raw from outputs
             where provider = ?
             order by json_extract(raw, ?) desc, rowid desc
             limit ? offset ?",
            &[
                provider.into(),
                order_path.into(),
                i64::from(limit).into(),
                offset.into(),
            ],
        )
        .await
    }

    /// Insert `full` when its key is new, otherwise merge-patch `patch` into the stored payload.
    pub async fn upsert_output(
        &mut self,
        full: &OutputRow,
        patch: &OutputRow,
    ) -> Result<UpsertOutcome, StorageError> {
        let inserted = self
            .run(
                "insert into outputs (id, input_id, provider, raw) values (?, ?, ?, json(?))
                 on conflict (id, input_id, provider) do nothing",
                &[
                    (&full.id).into(),
                    (&full.input_id).into(),
                    full.provider.into(),
                    (&full.raw).into(),
                ],
            )
            .await?;
        if inserted > 0 {
            return Ok(UpsertOutcome::Inserted);
        }

        let stored: Vec<(String,)> = self
            .execute(
                "select raw from outputs where id = ? and input_id = ? and provider = ?",
                &[(&patch.id).into(), (&patch.input_id).into(), patch.provider.into()],
            )
            .await?;
        let Some((raw,)) = stored.into_iter().next() else {
            return Ok(UpsertOutcome::Inserted);
        };

        let merged = merge_patch_str(&raw, &patch.raw).map_err(|source| StorageError::Payload {
            key: patch.key(),
            source,
        })?;
        let Some(merged) = merged else {
            return Ok(UpsertOutcome::Unchanged);
        };
        self.run(
            "update outputs set raw = json(?) where id = ? and input_id = ? and provider = ?",
            &[
                merged.into(),
                (&patch.id).into(),
                (&patch.input_id).into(),
                patch.provider.into(),
            ],
        )
        .await?;
        Ok(UpsertOutcome::Merged)
    }
}

/// Open `BEGIN IMMEDIATE` transaction on a [`Database`].
pub struct Transaction<'a> {
    db: &'a mut Database,
    finished: bool,
}

impl Transaction<'_> {
    pub async fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.db.in_transaction = false;
        if let Err(err) = (&mut self.db.conn).execute("COMMIT").await {
            self.db.rollback().await;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn rollback(mut self) {
        self.finished = true;
        self.db.in_transaction = false;
        self.db.rollback().await;
    }
}

impl Deref for Transaction<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.db
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Database {
        self.db
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.db.in_transaction = false;
            self.db.abandoned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};
    use tempfile::{tempdir, TempDir};

    const P: ProviderTag = ProviderTag::BluRayComPhysicalRelease;

    async fn fresh_db() -> (TempDir, Database) {
        let dir = tempdir().expect("tempdir");
        let mut db = Database::open(dir.path().join("data").join("app.db"))
            .await
            .expect("open");
        db.migrate().await.expect("migrate");
        (dir, db)
    }

    fn source(id: &str) -> SourceRow {
        SourceRow {
            id: id.to_string(),
            provider: P,
            raw: json!({ "code": id, "name": "France" }).to_string(),
        }
    }

    fn output(id: &str, raw: JsonValue) -> OutputRow {
        OutputRow {
            id: id.to_string(),
            input_id: "fr".to_string(),
            provider: P,
            raw: raw.to_string(),
        }
    }

    async fn count_outputs(db: &mut Database) -> i64 {
        let rows: Vec<(i64,)> = db.execute("select count(*) from outputs", &[]).await.unwrap();
        rows[0].0
    }

    #[tokio::test]
    async fn construction_applies_pragmas() {
        let (_dir, mut db) = fresh_db().await;
        let mode: Vec<(String,)> = db.execute("pragma journal_mode", &[]).await.unwrap();
        let fk: Vec<(i64,)> = db.execute("pragma foreign_keys", &[]).await.unwrap();
        let sync: Vec<(i64,)> = db.execute("pragma synchronous", &[]).await.unwrap();
        assert_eq!(mode[0].0.to_ascii_lowercase(), "wal");
        assert_eq!(fk[0].0, 1);
        assert_eq!(sync[0].0, 1);
    }

    #[tokio::test]
    async fn statements_are_cached_by_query_text() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();
        db.upsert_source(&source("de")).await.unwrap();
        let before = db.cached_statements();

        let rows = db.sources_for(P).await.unwrap();
        let again = db.sources_for(P).await.unwrap();

        assert_eq!(rows, again);
        assert_eq!(rows.len(), 2);
        assert_eq!(db.cached_statements(), before + 1);
    }

    #[tokio::test]
    async fn failing_statement_is_evicted_from_cache() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();
        let cached = db.cached_statements();

        let bad = SourceRow {
            raw: "{not json".to_string(),
            ..source("de")
        };
        let err = db.upsert_source(&bad).await.unwrap_err();

        assert!(matches!(err, StorageError::Sqlx(_)));
        assert_eq!(db.cached_statements(), cached - 1);
        db.upsert_source(&source("de")).await.unwrap();
        assert_eq!(db.cached_statements(), cached);
    }

    #[tokio::test]
    async fn invalid_sql_is_never_cached() {
        let (_dir, mut db) = fresh_db().await;
        let err = db
            .execute::<(i64,)>("select nope from missing_table", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Sqlx(_)));
        assert_eq!(db.cached_statements(), 0);
    }

    #[tokio::test]
    async fn transaction_commits_on_success() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(tx.in_transaction());
        for row in [output("1", json!({ "title": "a" })), output("2", json!({ "title": "b" }))] {
            tx.upsert_output(&row, &row).await.unwrap();
        }
        tx.commit().await.unwrap();

        assert!(!db.in_transaction());
        assert_eq!(count_outputs(&mut db).await, 2);
    }

    #[tokio::test]
    async fn rollback_discards_every_write() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();

        let good = output("1", json!({ "title": "a" }));
        let bad = OutputRow {
            raw: "][".to_string(),
            ..output("2", json!({}))
        };
        let mut tx = db.begin().await.unwrap();
        tx.upsert_output(&good, &good).await.unwrap();
        assert!(tx.upsert_output(&bad, &bad).await.is_err());
        tx.rollback().await;

        assert_eq!(count_outputs(&mut db).await, 0);
    }

    #[tokio::test]
    async fn dropped_transaction_is_rolled_back() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();

        {
            let mut tx = db.begin().await.unwrap();
            let row = output("1", json!({ "title": "a" }));
            tx.upsert_output(&row, &row).await.unwrap();
        }

        assert!(!db.in_transaction());
        assert_eq!(count_outputs(&mut db).await, 0);
        let mut tx = db.begin().await.unwrap();
        let row = output("2", json!({ "title": "b" }));
        tx.upsert_output(&row, &row).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(count_outputs(&mut db).await, 1);
    }

    #[tokio::test]
    async fn nested_transactions_are_rejected() {
        let (_dir, mut db) = fresh_db().await;
        let mut tx = db.begin().await.unwrap();
        assert!(matches!(tx.begin().await, Err(StorageError::NestedTransaction)));
        tx.commit().await.unwrap();
        assert!(db.begin().await.is_ok());
    }

    #[test]
    fn transaction_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let mut db: Option<Database> = None;
        if let Some(db) = db.as_mut() {
            assert_send(&db.begin());
            let row = output("1", json!({}));
            assert_send(&db.upsert_output(&row, &row));
        }
    }

    #[tokio::test]
    async fn upsert_output_inserts_then_merges_patch() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();

        let first = output("1", json!({ "title": "Old", "releaseDate": "2025-01-01T00:00:00Z" }));
        assert_eq!(
            db.upsert_output(&first, &first).await.unwrap(),
            UpsertOutcome::Inserted
        );

        assert_eq!(
            db.upsert_output(&first, &first).await.unwrap(),
            UpsertOutcome::Unchanged
        );

        let full = output("1", json!({ "title": "New", "releaseDate": "2030-01-01T00:00:00Z" }));
        let patch = output("1", json!({ "title": "New" }));
        assert_eq!(
            db.upsert_output(&full, &patch).await.unwrap(),
            UpsertOutcome::Merged
        );

        let stored = db.output("1", "fr", P).await.unwrap().unwrap();
        let raw: JsonValue = serde_json::from_str(&stored.raw).unwrap();
        assert_eq!(
            raw,
            json!({ "title": "New", "releaseDate": "2025-01-01T00:00:00Z" })
        );
        assert_eq!(count_outputs(&mut db).await, 1);
    }

    #[tokio::test]
    async fn outputs_require_an_owning_source() {
        let (_dir, mut db) = fresh_db().await;
        let orphan = output("1", json!({}));
        assert!(db.upsert_output(&orphan, &orphan).await.is_err());
    }

    #[tokio::test]
    async fn outputs_are_listed_newest_first() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();
        for (id, date) in [("1", "2025-01-01"), ("2", "2025-03-01"), ("3", "2025-02-01")] {
            let row = output(id, json!({ "releasedate": date }));
            db.upsert_output(&row, &row).await.unwrap();
        }

        let page0 = db.outputs_for(P, "$.releasedate", 2, 0).await.unwrap();
        let page1 = db.outputs_for(P, "$.releasedate", 2, 1).await.unwrap();

        let ids: Vec<_> = page0.iter().chain(&page1).map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);

        let far = db.outputs_for(P, "$.releasedate", u32::MAX, u32::MAX).await.unwrap();
        assert!(far.is_empty());
    }

    #[tokio::test]
    async fn update_source_raw_reports_missing_rows() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();

        let mut refreshed = source("fr");
        refreshed.raw = json!({ "code": "fr", "name": "France (all)" }).to_string();
        assert!(db.update_source_raw(&refreshed).await.unwrap());
        assert!(!db.update_source_raw(&source("xx")).await.unwrap());

        let rows = db.sources_for(P).await.unwrap();
        let raw: JsonValue = serde_json::from_str(&rows[0].raw).unwrap();
        assert_eq!(raw["name"], "France (all)");
    }

    #[tokio::test]
    async fn checkpoint_and_close_succeed() {
        let (_dir, mut db) = fresh_db().await;
        db.upsert_source(&source("fr")).await.unwrap();
        db.checkpoint().await.unwrap();
        db.close().await.unwrap();
    }
}
