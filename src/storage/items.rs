use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{
    AppliedDelta, DatabaseError, InsertedItem, ItemChange, ItemCounts, ItemDbRow, ItemDelta,
    ItemFilter, StoredItem,
};

/// Maximum number of items returned by the rendering queries (OOM protection)
const MAX_ITEMS: i64 = 5000;

/// Rows per multi-row INSERT. 10 columns * 50 = 500 parameters, under SQLite's 999 limit.
const INSERT_BATCH_SIZE: usize = 50;

/// Ids per `IN (...)` list.
const ID_BATCH_SIZE: usize = 500;

const ITEM_COLUMNS: &str = "items.id, items.feed_id, items.guid, items.title, items.link, \
                            items.published, items.summary, items.content_hash, items.status, \
                            items.first_seen, items.last_seen, items.archived_at";

fn status_clause(filter: ItemFilter) -> &'static str {
    match filter {
        ItemFilter::Active => " AND items.status = 'active'",
        ItemFilter::Archived => " AND items.status = 'archived'",
        ItemFilter::All => "",
    }
}

fn into_items(rows: Vec<ItemDbRow>) -> Result<Vec<StoredItem>, DatabaseError> {
    rows.into_iter().map(ItemDbRow::into_item).collect()
}

impl Database {
    // ========================================================================
    // Item Queries
    // ========================================================================

    /// Items of one feed with the given status, ordered by GUID.
    pub async fn get_items(
        &self,
        feed_id: i64,
        filter: ItemFilter,
    ) -> Result<Vec<StoredItem>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM items WHERE items.feed_id = ?{} ORDER BY items.guid",
            ITEM_COLUMNS,
            status_clause(filter)
        );
        let rows = sqlx::query_as::<_, ItemDbRow>(&sql)
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
        into_items(rows)
    }

    /// The feed's current active item set.
    pub async fn get_active_items(&self, feed_id: i64) -> Result<Vec<StoredItem>, DatabaseError> {
        self.get_items(feed_id, ItemFilter::Active).await
    }

    /// The feed's archived items, consulted for resurrection.
    pub async fn get_archived_items(
        &self,
        feed_id: i64,
    ) -> Result<Vec<StoredItem>, DatabaseError> {
        self.get_items(feed_id, ItemFilter::Archived).await
    }

    /// Items of the feed with this URL, newest first.
    ///
    /// Returns an empty list for an unknown feed.
    pub async fn get_items_for_feed_url(
        &self,
        url: &str,
        filter: ItemFilter,
    ) -> Result<Vec<StoredItem>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM items JOIN feeds ON feeds.id = items.feed_id \
             WHERE feeds.url = ?{} \
             ORDER BY COALESCE(items.published, items.first_seen) DESC, items.id DESC \
             LIMIT ?",
            ITEM_COLUMNS,
            status_clause(filter)
        );
        let rows = sqlx::query_as::<_, ItemDbRow>(&sql)
            .bind(url)
            .bind(MAX_ITEMS)
            .fetch_all(&self.pool)
            .await?;
        into_items(rows)
    }

    /// Active items across all feeds dated in `[since, until)`, newest first.
    ///
    /// An item's date is its published time, or the time it was first seen
    /// when the feed did not supply one.
    pub async fn get_items_in_range(
        &self,
        since: i64,
        until: i64,
    ) -> Result<Vec<StoredItem>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM items \
             WHERE items.status = 'active' \
               AND COALESCE(items.published, items.first_seen) >= ? \
               AND COALESCE(items.published, items.first_seen) < ? \
             ORDER BY COALESCE(items.published, items.first_seen) DESC, items.id DESC \
             LIMIT ?",
            ITEM_COLUMNS
        );
        let rows = sqlx::query_as::<_, ItemDbRow>(&sql)
            .bind(since)
            .bind(until)
            .bind(MAX_ITEMS)
            .fetch_all(&self.pool)
            .await?;
        into_items(rows)
    }

    /// Active and archived totals for one feed.
    pub async fn item_counts(&self, feed_id: i64) -> Result<ItemCounts, DatabaseError> {
        let (active, archived): (i64, i64) = sqlx::query_as(
            "SELECT
                COUNT(CASE WHEN status = 'active' THEN 1 END),
                COUNT(CASE WHEN status = 'archived' THEN 1 END)
             FROM items WHERE feed_id = ?",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ItemCounts { active, archived })
    }

    // ========================================================================
    // Item Mutations
    // ========================================================================

    /// Apply a reconciliation delta to one feed in a single transaction.
    ///
    /// Either every insert, update, resurrection, touch and archival lands, or
    /// none does. Returns the counts together with the ids of newly inserted
    /// rows, which downstream enrichment keys on.
    pub async fn apply_delta(
        &self,
        feed_id: i64,
        delta: &ItemDelta,
    ) -> Result<AppliedDelta, DatabaseError> {
        let now = delta.observed_at;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut inserted = Vec::with_capacity(delta.inserts.len());
        for chunk in delta.inserts.chunks(INSERT_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO items (feed_id, guid, title, link, published, summary, content_hash, \
                 status, first_seen, last_seen) ",
            );
            builder.push_values(chunk, |mut b, item| {
                b.push_bind(feed_id)
                    .push_bind(&item.guid)
                    .push_bind(&item.title)
                    .push_bind(&item.link)
                    .push_bind(item.published)
                    .push_bind(&item.summary)
                    .push_bind(&item.content_hash)
                    .push_bind("active")
                    .push_bind(now)
                    .push_bind(now);
            });
            builder.push(" RETURNING id, guid, link");

            let rows: Vec<(i64, String, Option<String>)> =
                builder.build_query_as().fetch_all(&mut *tx).await?;
            inserted.extend(rows.into_iter().map(|(item_id, guid, link)| InsertedItem {
                item_id,
                guid,
                link,
            }));
        }

        for ItemChange { item_id, item } in &delta.updates {
            let result = sqlx::query(
                "UPDATE items SET title = ?, link = ?, published = ?, summary = ?, \
                 content_hash = ?, last_seen = ? \
                 WHERE id = ? AND feed_id = ? AND status = 'active'",
            )
            .bind(&item.title)
            .bind(&item.link)
            .bind(item.published)
            .bind(&item.summary)
            .bind(&item.content_hash)
            .bind(now)
            .bind(*item_id)
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                tracing::warn!(feed_id = feed_id, item_id = item_id, "Updated item was not active");
            }
        }

        // first_seen is left alone so a resurrected item keeps its history.
        for ItemChange { item_id, item } in &delta.resurrections {
            let result = sqlx::query(
                "UPDATE items SET title = ?, link = ?, published = ?, summary = ?, \
                 content_hash = ?, last_seen = ?, status = 'active', archived_at = NULL \
                 WHERE id = ? AND feed_id = ? AND status = 'archived'",
            )
            .bind(&item.title)
            .bind(&item.link)
            .bind(item.published)
            .bind(&item.summary)
            .bind(&item.content_hash)
            .bind(now)
            .bind(*item_id)
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                tracing::warn!(feed_id = feed_id, item_id = item_id, "Resurrected item was not archived");
            }
        }

        for chunk in delta.touches.chunks(ID_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("UPDATE items SET last_seen = ");
            builder.push_bind(now);
            builder.push(" WHERE feed_id = ");
            builder.push_bind(feed_id);
            builder.push(" AND status = 'active' AND id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await?;
        }

        for chunk in delta.archivals.chunks(ID_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("UPDATE items SET status = 'archived', archived_at = ");
            builder.push_bind(now);
            builder.push(" WHERE feed_id = ");
            builder.push_bind(feed_id);
            builder.push(" AND status = 'active' AND id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        let counts = delta.counts();
        tracing::debug!(
            feed_id = feed_id,
            inserted = counts.inserted,
            updated = counts.updated,
            archived = counts.archived,
            resurrected = counts.resurrected,
            "Delta committed"
        );

        Ok(AppliedDelta { counts, inserted })
    }

    /// Permanently delete archived items archived strictly before `older_than`
    /// (Unix seconds). Active items are never touched.
    ///
    /// Returns the number of items deleted.
    pub async fn purge_archived(&self, older_than: i64) -> Result<u64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let result =
            sqlx::query("DELETE FROM items WHERE status = 'archived' AND archived_at < ?")
                .bind(older_than)
                .execute(&self.pool)
                .await?;

        let deleted = result.rows_affected();
        tracing::info!(deleted = deleted, older_than = older_than, "Purged archived items");
        Ok(deleted)
    }
}
