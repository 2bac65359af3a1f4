use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedDbRow, FeedMeta};

const FEED_COLUMNS: &str = "id, url, title, description, link, last_fetched, etag, last_modified, \
                            last_status, last_error, consecutive_failures";

impl Database {
    // ========================================================================
    // Feed Queries
    // ========================================================================

    /// Look up a feed by its canonical URL.
    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {} FROM feeds WHERE url = ?",
            FEED_COLUMNS
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    /// All known feeds, ordered by URL.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {} FROM feeds ORDER BY url",
            FEED_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    // ========================================================================
    // Feed Mutations
    // ========================================================================

    /// Return the id of the feed with this URL, creating an empty record if
    /// the feed has never been seen.
    pub async fn ensure_feed(&self, url: &str) -> Result<i64, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _guard = self.write_lock.lock().await;

        // The no-op DO UPDATE makes RETURNING yield the existing id on conflict.
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO feeds (url, created_at) VALUES (?, ?)
             ON CONFLICT(url) DO UPDATE SET url = excluded.url
             RETURNING id",
        )
        .bind(url)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Record the outcome of one fetch attempt and return the feed id.
    ///
    /// Runs as its own statement, outside any item transaction, so the attempt
    /// is recorded even when applying the item delta failed.
    ///
    /// - `last_fetched`, `last_status` and `last_error` are always overwritten.
    /// - `title`, `description`, `link` and the cache validators are only
    ///   replaced when the corresponding field of `meta` is `Some`.
    /// - `consecutive_failures` resets on success and increments on error.
    pub async fn upsert_feed_meta(&self, meta: &FeedMeta) -> Result<i64, DatabaseError> {
        let replace_validators = meta.validators.is_some();
        let (etag, last_modified) = match &meta.validators {
            Some(v) => (v.etag.as_deref(), v.last_modified.as_deref()),
            None => (None, None),
        };
        let failed = meta.error.is_some();
        let _guard = self.write_lock.lock().await;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (
                url, title, description, link, last_fetched, etag, last_modified,
                last_status, last_error, consecutive_failures, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = COALESCE(excluded.title, feeds.title),
                description = COALESCE(excluded.description, feeds.description),
                link = COALESCE(excluded.link, feeds.link),
                last_fetched = excluded.last_fetched,
                etag = CASE WHEN ? THEN excluded.etag ELSE feeds.etag END,
                last_modified = CASE WHEN ? THEN excluded.last_modified ELSE feeds.last_modified END,
                last_status = excluded.last_status,
                last_error = excluded.last_error,
                consecutive_failures = CASE WHEN ? THEN feeds.consecutive_failures + 1 ELSE 0 END
            RETURNING id
        "#,
        )
        .bind(&meta.url)
        .bind(&meta.title)
        .bind(&meta.description)
        .bind(&meta.link)
        .bind(meta.fetched_at)
        .bind(etag)
        .bind(last_modified)
        .bind(meta.status.map(i64::from))
        .bind(&meta.error)
        .bind(i64::from(failed))
        .bind(meta.fetched_at)
        .bind(replace_validators)
        .bind(replace_validators)
        .bind(failed)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Remove every feed whose URL is not in `keep`, cascading to its items.
    ///
    /// An empty `keep` set is treated as a mistake (an unreadable or empty
    /// subscription list) and removes nothing.
    ///
    /// Returns the number of feeds removed.
    pub async fn purge_orphaned_feeds(&self, keep: &[String]) -> Result<u64, DatabaseError> {
        if keep.is_empty() {
            tracing::warn!("Refusing to purge feeds against an empty subscription set");
            return Ok(0);
        }

        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let all: Vec<(i64, String)> = sqlx::query_as("SELECT id, url FROM feeds")
            .fetch_all(&mut *tx)
            .await?;
        let orphans: Vec<i64> = all
            .into_iter()
            .filter(|(_, url)| !keep.contains(url.as_str()))
            .map(|(id, _)| id)
            .collect();

        const BATCH_SIZE: usize = 500;
        let mut removed: u64 = 0;
        for chunk in orphans.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM feeds WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            removed += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        if removed > 0 {
            tracing::info!(removed = removed, "Purged feeds no longer subscribed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{CacheValidators, Database, FeedMeta};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn success_meta(url: &str, at: i64, etag: &str) -> FeedMeta {
        FeedMeta {
            url: url.to_string(),
            fetched_at: at,
            status: Some(200),
            error: None,
            validators: Some(CacheValidators {
                etag: Some(etag.to_string()),
                last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            }),
            title: Some("Example".to_string()),
            description: Some("An example feed".to_string()),
            link: Some("https://example.com/".to_string()),
        }
    }

    #[tokio::test]
    async fn test_ensure_feed_is_stable() {
        let db = test_db().await;
        let a = db.ensure_feed("https://example.com/feed").await.unwrap();
        let b = db.ensure_feed("https://example.com/feed").await.unwrap();
        assert_eq!(a, b);

        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert!(feeds[0].title.is_none());
        assert!(feeds[0].last_fetched.is_none());
    }

    #[tokio::test]
    async fn test_upsert_feed_meta_creates_feed() {
        let db = test_db().await;
        let id = db
            .upsert_feed_meta(&success_meta("https://example.com/feed", 100, "e1"))
            .await
            .unwrap();

        let feed = db
            .get_feed_by_url("https://example.com/feed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feed.id, id);
        assert_eq!(feed.title.as_deref(), Some("Example"));
        assert_eq!(feed.last_fetched, Some(100));
        assert_eq!(feed.validators.etag.as_deref(), Some("e1"));
        assert_eq!(feed.last_status, Some(200));
        assert_eq!(feed.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_failed_attempt_keeps_metadata_and_validators() {
        let db = test_db().await;
        let url = "https://example.com/feed";
        db.upsert_feed_meta(&success_meta(url, 100, "e1")).await.unwrap();

        db.upsert_feed_meta(&FeedMeta {
            url: url.to_string(),
            fetched_at: 200,
            status: Some(500),
            error: Some("HTTP error: status 500".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let feed = db.get_feed_by_url(url).await.unwrap().unwrap();
        assert_eq!(feed.title.as_deref(), Some("Example"));
        assert_eq!(feed.validators.etag.as_deref(), Some("e1"));
        assert_eq!(feed.last_fetched, Some(200));
        assert_eq!(feed.last_status, Some(500));
        assert_eq!(feed.last_error.as_deref(), Some("HTTP error: status 500"));
        assert_eq!(feed.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_failure_counter_resets_on_success() {
        let db = test_db().await;
        let url = "https://example.com/feed";
        let failure = FeedMeta {
            url: url.to_string(),
            fetched_at: 10,
            error: Some("Request timed out".to_string()),
            ..Default::default()
        };
        db.upsert_feed_meta(&failure).await.unwrap();
        db.upsert_feed_meta(&failure).await.unwrap();
        assert_eq!(
            db.get_feed_by_url(url).await.unwrap().unwrap().consecutive_failures,
            2
        );

        db.upsert_feed_meta(&success_meta(url, 20, "e2")).await.unwrap();
        let feed = db.get_feed_by_url(url).await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 0);
        assert!(feed.last_error.is_none());
    }

    #[tokio::test]
    async fn test_explicit_empty_validators_clear_stored_ones() {
        let db = test_db().await;
        let url = "https://example.com/feed";
        db.upsert_feed_meta(&success_meta(url, 100, "e1")).await.unwrap();

        db.upsert_feed_meta(&FeedMeta {
            url: url.to_string(),
            fetched_at: 200,
            status: Some(200),
            validators: Some(CacheValidators::default()),
            ..Default::default()
        })
        .await
        .unwrap();

        let feed = db.get_feed_by_url(url).await.unwrap().unwrap();
        assert!(feed.validators.is_empty());
    }

    #[tokio::test]
    async fn test_purge_orphaned_feeds() {
        let db = test_db().await;
        db.ensure_feed("https://a.example.com/feed").await.unwrap();
        db.ensure_feed("https://b.example.com/feed").await.unwrap();
        db.ensure_feed("https://c.example.com/feed").await.unwrap();

        let removed = db
            .purge_orphaned_feeds(&["https://b.example.com/feed".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let urls: Vec<String> = db
            .list_feeds()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.url)
            .collect();
        assert_eq!(urls, vec!["https://b.example.com/feed".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_orphaned_feeds_empty_keep_set_is_noop() {
        let db = test_db().await;
        db.ensure_feed("https://a.example.com/feed").await.unwrap();

        assert_eq!(db.purge_orphaned_feeds(&[]).await.unwrap(), 0);
        assert_eq!(db.list_feeds().await.unwrap().len(), 1);
    }
}
