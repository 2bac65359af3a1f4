use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the feed/item store.
///
/// Cheap to clone; every clone shares the same pool. This is the only owner of
/// persisted feed and item records: the scheduler and the reconciler work on
/// copies returned by its queries.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    /// SQLite allows one writer at a time. Write transactions take this lock
    /// first so concurrent feed commits queue here instead of racing for the
    /// file lock and failing with SQLITE_BUSY.
    pub(crate) write_lock: Arc<Mutex<()>>,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database (used by tests).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // Restrict the database file to the current user before the pool creates it.
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() && db_path.parent().map_or(true, |p| p.exists()) {
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok(); // If creation fails, SQLite will report the error at connect_with.
            }
        }

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks held by other
        // processes before returning SQLITE_BUSY.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives inside a single connection.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::InstanceLocked => DatabaseError::InstanceLocked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT,
                description TEXT,
                link TEXT,
                last_fetched INTEGER,
                etag TEXT,
                last_modified TEXT,
                last_status INTEGER,
                last_error TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // An archived row always carries archived_at and an active row never does.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                title TEXT NOT NULL,
                link TEXT,
                published INTEGER,
                summary TEXT,
                content_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'archived')),
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                archived_at INTEGER,
                CHECK ((status = 'archived') = (archived_at IS NOT NULL)),
                UNIQUE(feed_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Per-feed lookups by lifecycle status (reconciliation reads)
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_feed_status ON items(feed_id, status)")
            .execute(&mut *tx)
            .await?;

        // Purge-by-age scans archived rows only
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_archived_at ON items(archived_at) WHERE status = 'archived'",
        )
        .execute(&mut *tx)
        .await?;

        // Time-range queries for rendering
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_published ON items(published DESC, first_seen DESC)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
