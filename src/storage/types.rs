use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Database is locked by another feedvault process. Wait for it to finish and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored row holds a value the application does not understand
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Feeds
// ============================================================================

/// HTTP cache validators remembered between fetches of one feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheValidators {
    /// `ETag` response header, sent back as `If-None-Match`
    pub etag: Option<String>,
    /// `Last-Modified` response header, sent back as `If-Modified-Since`
    pub last_modified: Option<String>,
}

impl CacheValidators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Feed record from the database
#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    /// Unix seconds of the last fetch attempt, successful or not
    pub last_fetched: Option<i64>,
    pub validators: CacheValidators,
    /// HTTP status of the last attempt (`None` when no response was received)
    pub last_status: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub last_fetched: Option<i64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_status: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            url: self.url,
            title: self.title,
            description: self.description,
            link: self.link,
            last_fetched: self.last_fetched,
            validators: CacheValidators {
                etag: self.etag,
                last_modified: self.last_modified,
            },
            last_status: self.last_status,
            last_error: self.last_error,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Bookkeeping for one fetch attempt, written by [`Database::upsert_feed_meta`].
///
/// `None` in the descriptive fields and in `validators` means "keep what is
/// stored", so a 304 or a failed attempt never erases known metadata.
///
/// [`Database::upsert_feed_meta`]: super::Database::upsert_feed_meta
#[derive(Debug, Clone, Default)]
pub struct FeedMeta {
    pub url: String,
    pub fetched_at: i64,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub validators: Option<CacheValidators>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
}

// ============================================================================
// Items
// ============================================================================

/// Lifecycle status of a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Active,
    Archived,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Active => "active",
            ItemStatus::Archived => "archived",
        }
    }

    fn from_db(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "active" => Ok(ItemStatus::Active),
            "archived" => Ok(ItemStatus::Archived),
            other => Err(DatabaseError::Corrupt(format!("unknown item status '{}'", other))),
        }
    }
}

/// Which items a query should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemFilter {
    #[default]
    Active,
    Archived,
    All,
}

/// An item as normalized by the feed parser, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<i64>,
    pub summary: Option<String>,
    pub content_hash: String,
}

/// Item record from the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredItem {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<i64>,
    pub summary: Option<String>,
    pub content_hash: String,
    pub status: ItemStatus,
    pub first_seen: i64,
    pub last_seen: i64,
    pub archived_at: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<i64>,
    pub summary: Option<String>,
    pub content_hash: String,
    pub status: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub archived_at: Option<i64>,
}

impl ItemDbRow {
    pub(crate) fn into_item(self) -> Result<StoredItem, DatabaseError> {
        Ok(StoredItem {
            id: self.id,
            feed_id: self.feed_id,
            guid: self.guid,
            title: self.title,
            link: self.link,
            published: self.published,
            summary: self.summary,
            content_hash: self.content_hash,
            status: ItemStatus::from_db(&self.status)?,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            archived_at: self.archived_at,
        })
    }
}

// ============================================================================
// Deltas
// ============================================================================

/// A stored item whose row must be rewritten with fresh content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    pub item_id: i64,
    pub item: ParsedItem,
}

/// The changes that bring one feed's stored items in line with a fresh parse.
///
/// Every list is ordered by GUID so two deltas computed from the same inputs
/// compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDelta {
    /// Unix seconds of the fetch cycle that produced this delta
    pub observed_at: i64,
    /// Never seen before
    pub inserts: Vec<ParsedItem>,
    /// Active and still present, content changed
    pub updates: Vec<ItemChange>,
    /// Archived earlier, present again
    pub resurrections: Vec<ItemChange>,
    /// Active and still present, content unchanged (ids only)
    pub touches: Vec<i64>,
    /// Active but gone from the feed (ids only)
    pub archivals: Vec<i64>,
}

impl ItemDelta {
    pub fn counts(&self) -> DeltaCounts {
        DeltaCounts {
            inserted: self.inserts.len(),
            updated: self.updates.len(),
            archived: self.archivals.len(),
            resurrected: self.resurrections.len(),
            unchanged: self.touches.len(),
        }
    }

    /// True when applying the delta would change nothing except `last_seen`.
    pub fn has_no_content_changes(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.resurrections.is_empty()
            && self.archivals.is_empty()
    }
}

/// Per-category sizes of a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeltaCounts {
    pub inserted: usize,
    pub updated: usize,
    pub archived: usize,
    pub resurrected: usize,
    pub unchanged: usize,
}

/// A row created by [`Database::apply_delta`].
///
/// [`Database::apply_delta`]: super::Database::apply_delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedItem {
    pub item_id: i64,
    pub guid: String,
    pub link: Option<String>,
}

/// Outcome of a committed delta.
#[derive(Debug, Clone, Default)]
pub struct AppliedDelta {
    pub counts: DeltaCounts,
    pub inserted: Vec<InsertedItem>,
}

/// Item totals for one feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    pub active: i64,
    pub archived: i64,
}
